use std::str::FromStr;

use services::types::{
    Address, Attempt, AttemptState, B256, CheckerSpec, DateTime, Tx, TxState, TxType, U256, Utc,
};

use crate::error::{Error, Result};

/// Row of the `txes` table. `NUMERIC` columns travel as text.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TxRow {
    pub id: i64,
    pub from_address: Vec<u8>,
    pub to_address: Vec<u8>,
    pub chain_id: i64,
    pub nonce: Option<i64>,
    pub encoded_payload: Vec<u8>,
    pub gas_limit: i64,
    pub value: String,
    pub state: String,
    pub error: Option<String>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub initial_broadcast_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub checker_spec: Option<String>,
    pub pipeline_task_run_id: Option<i64>,
    pub subject: Option<String>,
}

/// Column list matching [`TxRow`], with `NUMERIC` cast for sqlx.
pub(crate) const TX_COLUMNS: &str = "id, from_address, to_address, chain_id, nonce, \
     encoded_payload, gas_limit, value::TEXT AS value, state, error, broadcast_at, \
     initial_broadcast_at, created_at, checker_spec, pipeline_task_run_id, subject";

impl TryFrom<TxRow> for Tx {
    type Error = Error;

    fn try_from(row: TxRow) -> Result<Self> {
        let state = TxState::from_db(&row.state)
            .ok_or_else(|| Error::Conversion(format!("unknown tx state `{}`", row.state)))?;

        Ok(Tx {
            id: row.id,
            from_address: address_from_bytes(&row.from_address)?,
            to_address: address_from_bytes(&row.to_address)?,
            chain_id: row.chain_id as u64,
            nonce: row.nonce,
            encoded_payload: row.encoded_payload,
            gas_limit: row.gas_limit as u64,
            value: U256::from_str(&row.value)
                .map_err(|e| Error::Conversion(format!("bad tx value `{}`: {e}", row.value)))?,
            state,
            error: row.error,
            broadcast_at: row.broadcast_at,
            initial_broadcast_at: row.initial_broadcast_at,
            created_at: row.created_at,
            checker_spec: CheckerSpec(row.checker_spec),
            pipeline_task_run_id: row.pipeline_task_run_id,
            subject: row.subject,
        })
    }
}

/// Row of the `tx_attempts` table.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AttemptRow {
    pub id: i64,
    pub tx_id: i64,
    pub state: String,
    pub hash: Vec<u8>,
    pub tx_type: i16,
    pub signed_payload: Vec<u8>,
    pub gas_price: Option<String>,
    pub gas_tip_cap: Option<String>,
    pub gas_fee_cap: Option<String>,
}

pub(crate) const ATTEMPT_COLUMNS: &str = "id, tx_id, state, hash, tx_type, signed_payload, \
     gas_price::TEXT AS gas_price, gas_tip_cap::TEXT AS gas_tip_cap, \
     gas_fee_cap::TEXT AS gas_fee_cap";

impl TryFrom<AttemptRow> for Attempt {
    type Error = Error;

    fn try_from(row: AttemptRow) -> Result<Self> {
        let state = AttemptState::from_db(&row.state)
            .ok_or_else(|| Error::Conversion(format!("unknown attempt state `{}`", row.state)))?;

        let tx_type = u8::try_from(row.tx_type)
            .ok()
            .and_then(TxType::from_u8)
            .ok_or_else(|| Error::Conversion(format!("unknown tx type `{}`", row.tx_type)))?;

        let hash: [u8; 32] = row
            .hash
            .as_slice()
            .try_into()
            .map_err(|_| Error::Conversion(format!("bad attempt hash length {}", row.hash.len())))?;

        Ok(Attempt {
            id: row.id,
            tx_id: row.tx_id,
            state,
            hash: B256::from(hash),
            tx_type,
            signed_payload: row.signed_payload,
            gas_price: parse_wei(row.gas_price.as_deref())?,
            gas_tip_cap: parse_wei(row.gas_tip_cap.as_deref())?,
            gas_fee_cap: parse_wei(row.gas_fee_cap.as_deref())?,
        })
    }
}

fn parse_wei(value: Option<&str>) -> Result<Option<u128>> {
    value
        .map(|v| {
            v.parse::<u128>()
                .map_err(|e| Error::Conversion(format!("bad wei amount `{v}`: {e}")))
        })
        .transpose()
}

fn address_from_bytes(bytes: &[u8]) -> Result<Address> {
    Address::try_from(bytes)
        .map_err(|_| Error::Conversion(format!("bad address length {}", bytes.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use services::types::Utc;

    fn given_tx_row() -> TxRow {
        TxRow {
            id: 7,
            from_address: vec![0xAA; 20],
            to_address: vec![0xBB; 20],
            chain_id: 1,
            nonce: Some(3),
            encoded_payload: vec![0xCA, 0xFE],
            gas_limit: 21_000,
            value: "1000000000000000000".to_string(),
            state: "unconfirmed".to_string(),
            error: None,
            broadcast_at: Some(Utc::now()),
            initial_broadcast_at: Some(Utc::now()),
            created_at: Utc::now(),
            checker_spec: None,
            pipeline_task_run_id: None,
            subject: Some("job-17".to_string()),
        }
    }

    #[test]
    fn converts_a_tx_row() {
        // given
        let row = given_tx_row();

        // when
        let tx = Tx::try_from(row).unwrap();

        // then
        assert_eq!(tx.id, 7);
        assert_eq!(tx.from_address, Address::repeat_byte(0xAA));
        assert_eq!(tx.state, TxState::Unconfirmed);
        assert_eq!(tx.value, U256::from(10u64).pow(U256::from(18u64)));
        assert_eq!(tx.subject.as_deref(), Some("job-17"));
    }

    #[test]
    fn rejects_an_unknown_tx_state() {
        // given
        let mut row = given_tx_row();
        row.state = "launched".to_string();

        // when
        let result = Tx::try_from(row);

        // then
        let Err(Error::Conversion(msg)) = result else {
            panic!("should be a conversion error");
        };
        assert!(msg.contains("launched"));
    }

    #[test]
    fn converts_an_attempt_row_with_dynamic_fees() {
        // given
        let row = AttemptRow {
            id: 1,
            tx_id: 7,
            state: "broadcast".to_string(),
            hash: vec![0x42; 32],
            tx_type: 2,
            signed_payload: vec![0xBE, 0xEF],
            gas_price: None,
            gas_tip_cap: Some("2000000000".to_string()),
            gas_fee_cap: Some("20000000000".to_string()),
        };

        // when
        let attempt = Attempt::try_from(row).unwrap();

        // then
        assert_eq!(attempt.state, AttemptState::Broadcast);
        assert_eq!(attempt.tx_type, TxType::DynamicFee);
        assert_eq!(attempt.gas_price, None);
        assert_eq!(attempt.gas_tip_cap, Some(2_000_000_000));
        assert_eq!(attempt.gas_fee_cap, Some(20_000_000_000));
    }

    #[test]
    fn rejects_a_malformed_hash() {
        // given
        let row = AttemptRow {
            id: 1,
            tx_id: 7,
            state: "in_progress".to_string(),
            hash: vec![0x42; 31],
            tx_type: 0,
            signed_payload: vec![],
            gas_price: Some("1".to_string()),
            gas_tip_cap: None,
            gas_fee_cap: None,
        };

        // when
        let result = Attempt::try_from(row);

        // then
        assert!(matches!(result, Err(Error::Conversion(_))));
    }
}

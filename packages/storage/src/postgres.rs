use futures::future::BoxFuture;
use services::types::{Address, Attempt, AttemptState, Tx, TxState};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use super::error::{Error, Result};
use crate::mappings::tables::{ATTEMPT_COLUMNS, AttemptRow, TX_COLUMNS, TxRow};

/// Work to run inside the `persist_broadcast` database transaction,
/// committing or rolling back together with it.
pub type Finalizer =
    Box<dyn for<'c> FnOnce(&'c mut sqlx::PgConnection) -> BoxFuture<'c, sqlx::Result<()>> + Send>;

#[derive(Clone)]
pub struct Postgres {
    connection_pool: sqlx::Pool<sqlx::Postgres>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DbConfig {
    /// The hostname or IP address of the `PostgreSQL` server.
    pub host: String,
    /// The port number on which the `PostgreSQL` server is listening.
    pub port: u16,
    /// The username used to authenticate with the `PostgreSQL` server.
    pub username: String,
    /// The password used to authenticate with the `PostgreSQL` server.
    pub password: String,
    /// The name of the database to connect to on the `PostgreSQL` server.
    pub database: String,
    /// The maximum number of connections allowed in the connection pool.
    pub max_connections: u32,
    /// Whether to use SSL when connecting to the `PostgreSQL` server.
    pub use_ssl: bool,
}

impl Postgres {
    pub async fn connect(opt: &DbConfig) -> services::broadcaster::port::storage::Result<Self> {
        let ssl_mode = if opt.use_ssl {
            sqlx::postgres::PgSslMode::Require
        } else {
            sqlx::postgres::PgSslMode::Disable
        };

        let options = PgConnectOptions::new()
            .ssl_mode(ssl_mode)
            .username(&opt.username)
            .password(&opt.password)
            .database(&opt.database)
            .host(&opt.host)
            .port(opt.port);

        let connection_pool = PgPoolOptions::new()
            .max_connections(opt.max_connections)
            .connect_with(options)
            .await
            .map_err(Error::from)?;

        Ok(Self { connection_pool })
    }

    /// Close only when shutting down the application. Will close the
    /// connection pool even if it is shared.
    pub async fn close(self) {
        self.connection_pool.close().await;
    }

    pub async fn migrate(&self) -> services::broadcaster::port::storage::Result<()> {
        sqlx::migrate!()
            .run(&self.connection_pool)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> sqlx::Pool<sqlx::Postgres> {
        self.connection_pool.clone()
    }

    pub(crate) async fn _insert_unstarted(&self, tx: Tx) -> Result<Tx> {
        let query = format!(
            "INSERT INTO txes (from_address, to_address, chain_id, encoded_payload, gas_limit, \
             value, state, created_at, checker_spec, pipeline_task_run_id, subject) \
             VALUES ($1, $2, $3, $4, $5, CAST($6 AS NUMERIC), $7, $8, $9, $10, $11) \
             RETURNING {TX_COLUMNS}"
        );

        let row = sqlx::query_as::<_, TxRow>(&query)
            .bind(tx.from_address.as_slice())
            .bind(tx.to_address.as_slice())
            .bind(tx.chain_id as i64)
            .bind(&tx.encoded_payload)
            .bind(tx.gas_limit as i64)
            .bind(tx.value.to_string())
            .bind(TxState::Unstarted.as_db())
            .bind(tx.created_at)
            .bind(tx.checker_spec.0.as_deref())
            .bind(tx.pipeline_task_run_id)
            .bind(tx.subject.as_deref())
            .fetch_one(&self.connection_pool)
            .await?;

        row.try_into()
    }

    pub(crate) async fn _get_in_progress(&self, address: Address) -> Result<Option<(Tx, Attempt)>> {
        let query = format!("SELECT {TX_COLUMNS} FROM txes WHERE from_address = $1 AND state = $2");
        let mut rows = sqlx::query_as::<_, TxRow>(&query)
            .bind(address.as_slice())
            .bind(TxState::InProgress.as_db())
            .fetch_all(&self.connection_pool)
            .await?;

        let tx: Tx = match rows.len() {
            0 => return Ok(None),
            1 => rows.remove(0).try_into()?,
            n => {
                return Err(Error::InvariantViolation(format!(
                    "expected at most one in_progress transaction for {address}, found {n}"
                )));
            }
        };

        let query = format!("SELECT {ATTEMPT_COLUMNS} FROM tx_attempts WHERE tx_id = $1");
        let attempts = sqlx::query_as::<_, AttemptRow>(&query)
            .bind(tx.id)
            .fetch_all(&self.connection_pool)
            .await?
            .into_iter()
            .map(Attempt::try_from)
            .collect::<Result<Vec<_>>>()?;

        match attempts.as_slice() {
            [attempt] if attempt.state == AttemptState::InProgress => {
                Ok(Some((tx, attempt.clone())))
            }
            _ => Err(Error::InvariantViolation(format!(
                "expected in_progress transaction {} to have exactly one unsent attempt; the \
                 database is in an inconsistent state and this sender cannot continue until the \
                 problem is resolved",
                tx.id
            ))),
        }
    }

    pub(crate) async fn _next_unstarted(&self, address: Address, chain_id: u64) -> Result<Option<Tx>> {
        let query = format!(
            "SELECT {TX_COLUMNS} FROM txes \
             WHERE from_address = $1 AND chain_id = $2 AND state = $3 \
             ORDER BY value ASC, created_at ASC, id ASC LIMIT 1"
        );

        sqlx::query_as::<_, TxRow>(&query)
            .bind(address.as_slice())
            .bind(chain_id as i64)
            .bind(TxState::Unstarted.as_db())
            .fetch_optional(&self.connection_pool)
            .await?
            .map(Tx::try_from)
            .transpose()
    }

    pub(crate) async fn _count_in_state(
        &self,
        address: Address,
        chain_id: u64,
        state: TxState,
    ) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM txes WHERE from_address = $1 AND chain_id = $2 AND state = $3",
        )
        .bind(address.as_slice())
        .bind(chain_id as i64)
        .bind(state.as_db())
        .fetch_one(&self.connection_pool)
        .await?;

        Ok(count as usize)
    }

    pub(crate) async fn _persist_in_progress(&self, tx: &mut Tx, attempt: &mut Attempt) -> Result<()> {
        let mut db_tx = self.connection_pool.begin().await?;

        let inserted: std::result::Result<i64, sqlx::Error> = sqlx::query_scalar(
            "INSERT INTO tx_attempts (tx_id, state, hash, tx_type, signed_payload, gas_price, \
             gas_tip_cap, gas_fee_cap) \
             VALUES ($1, $2, $3, $4, $5, CAST($6 AS NUMERIC), CAST($7 AS NUMERIC), \
             CAST($8 AS NUMERIC)) RETURNING id",
        )
        .bind(tx.id)
        .bind(attempt.state.as_db())
        .bind(attempt.hash.as_slice())
        .bind(attempt.tx_type.as_u8() as i16)
        .bind(&attempt.signed_payload)
        .bind(attempt.gas_price.map(|v| v.to_string()))
        .bind(attempt.gas_tip_cap.map(|v| v.to_string()))
        .bind(attempt.gas_fee_cap.map(|v| v.to_string()))
        .fetch_one(&mut *db_tx)
        .await;

        let attempt_id = match inserted {
            Ok(id) => id,
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint() == Some("tx_attempts_tx_id_fkey") =>
            {
                return Err(Error::TxRemoved);
            }
            Err(e) => return Err(e.into()),
        };

        let updated = sqlx::query(
            "UPDATE txes SET nonce = $1, state = $2 WHERE id = $3 AND state = $4",
        )
        .bind(tx.nonce)
        .bind(TxState::InProgress.as_db())
        .bind(tx.id)
        .bind(TxState::Unstarted.as_db())
        .execute(&mut *db_tx)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(Error::InvariantViolation(format!(
                "can only transition to in_progress from unstarted, transaction {} changed \
                 underneath us",
                tx.id
            )));
        }

        db_tx.commit().await?;

        attempt.id = attempt_id;
        attempt.tx_id = tx.id;
        Ok(())
    }

    pub(crate) async fn _persist_broadcast(
        &self,
        tx: &mut Tx,
        attempt: &mut Attempt,
        finalizers: Vec<Finalizer>,
    ) -> Result<()> {
        let nonce = tx.nonce.ok_or_else(|| {
            Error::InvariantViolation(format!("transaction {} has no nonce", tx.id))
        })?;

        let mut db_tx = self.connection_pool.begin().await?;

        let incremented = sqlx::query(
            "UPDATE key_states SET next_nonce = next_nonce + 1, updated_at = now() \
             WHERE address = $1 AND chain_id = $2 AND next_nonce = $3",
        )
        .bind(tx.from_address.as_slice())
        .bind(tx.chain_id as i64)
        .bind(nonce)
        .execute(&mut *db_tx)
        .await?;

        if incremented.rows_affected() == 0 {
            return Err(Error::InvariantViolation(
                "could not increment nonce because no rows matched; either the key is missing \
                 or the nonce has been modified by an external process"
                    .to_string(),
            ));
        }

        let updated = sqlx::query(
            "UPDATE txes SET state = $1, error = NULL, broadcast_at = $2, \
             initial_broadcast_at = $3 WHERE id = $4 AND state = $5",
        )
        .bind(TxState::Unconfirmed.as_db())
        .bind(tx.broadcast_at)
        .bind(tx.initial_broadcast_at)
        .bind(tx.id)
        .bind(TxState::InProgress.as_db())
        .execute(&mut *db_tx)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(Error::InvariantViolation(format!(
                "can only transition to unconfirmed from in_progress, transaction {} changed \
                 underneath us",
                tx.id
            )));
        }

        let updated = sqlx::query("UPDATE tx_attempts SET state = $1 WHERE id = $2 AND state = $3")
            .bind(AttemptState::Broadcast.as_db())
            .bind(attempt.id)
            .bind(AttemptState::InProgress.as_db())
            .execute(&mut *db_tx)
            .await?;

        if updated.rows_affected() != 1 {
            return Err(Error::InvariantViolation(format!(
                "attempt {} is not in_progress",
                attempt.id
            )));
        }

        for finalizer in finalizers {
            finalizer(&mut *db_tx).await?;
        }

        db_tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn _persist_fatal(&self, tx: &mut Tx) -> Result<()> {
        let mut db_tx = self.connection_pool.begin().await?;

        sqlx::query("DELETE FROM tx_attempts WHERE tx_id = $1")
            .bind(tx.id)
            .execute(&mut *db_tx)
            .await?;

        let updated = sqlx::query(
            "UPDATE txes SET state = $1, error = $2, nonce = NULL, broadcast_at = NULL, \
             initial_broadcast_at = NULL WHERE id = $3 AND state = $4",
        )
        .bind(TxState::FatalError.as_db())
        .bind(tx.error.as_deref())
        .bind(tx.id)
        .bind(TxState::InProgress.as_db())
        .execute(&mut *db_tx)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(Error::InvariantViolation(format!(
                "can only transition to fatal_error from in_progress, transaction {} changed \
                 underneath us",
                tx.id
            )));
        }

        db_tx.commit().await?;
        Ok(())
    }

    pub(crate) async fn _persist_replacement_attempt(
        &self,
        old: &Attempt,
        new: &mut Attempt,
    ) -> Result<()> {
        let mut db_tx = self.connection_pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM tx_attempts WHERE id = $1 AND state = $2")
            .bind(old.id)
            .bind(AttemptState::InProgress.as_db())
            .execute(&mut *db_tx)
            .await?;

        if deleted.rows_affected() != 1 {
            return Err(Error::InvariantViolation(format!(
                "attempt {} is not replaceable",
                old.id
            )));
        }

        let new_id: i64 = sqlx::query_scalar(
            "INSERT INTO tx_attempts (tx_id, state, hash, tx_type, signed_payload, gas_price, \
             gas_tip_cap, gas_fee_cap) \
             VALUES ($1, $2, $3, $4, $5, CAST($6 AS NUMERIC), CAST($7 AS NUMERIC), \
             CAST($8 AS NUMERIC)) RETURNING id",
        )
        .bind(new.tx_id)
        .bind(new.state.as_db())
        .bind(new.hash.as_slice())
        .bind(new.tx_type.as_u8() as i16)
        .bind(&new.signed_payload)
        .bind(new.gas_price.map(|v| v.to_string()))
        .bind(new.gas_tip_cap.map(|v| v.to_string()))
        .bind(new.gas_fee_cap.map(|v| v.to_string()))
        .fetch_one(&mut *db_tx)
        .await?;

        db_tx.commit().await?;

        new.id = new_id;
        Ok(())
    }

    pub(crate) async fn _next_nonce(&self, address: Address, chain_id: u64) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT next_nonce FROM key_states WHERE address = $1 AND chain_id = $2",
        )
        .bind(address.as_slice())
        .bind(chain_id as i64)
        .fetch_optional(&self.connection_pool)
        .await?
        .ok_or_else(|| {
            Error::InvariantViolation(format!(
                "no key state row for address {address} on chain {chain_id}"
            ))
        })
    }

    pub(crate) async fn _ensure_key_state(&self, address: Address, chain_id: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO key_states (address, chain_id, next_nonce) VALUES ($1, $2, 0) \
             ON CONFLICT (address, chain_id) DO NOTHING",
        )
        .bind(address.as_slice())
        .bind(chain_id as i64)
        .execute(&self.connection_pool)
        .await?;
        Ok(())
    }

    pub(crate) async fn _fast_forward_nonce(
        &self,
        address: Address,
        chain_id: u64,
        nonce: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE key_states SET next_nonce = $3, updated_at = now() \
             WHERE address = $1 AND chain_id = $2 AND next_nonce < $3",
        )
        .bind(address.as_slice())
        .bind(chain_id as i64)
        .bind(nonce)
        .execute(&self.connection_pool)
        .await?;
        Ok(())
    }
}

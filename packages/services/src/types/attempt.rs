use super::B256;

/// A signed instantiation of a [`super::Tx`] at a chosen fee.
///
/// A transaction accumulates attempts over its lifetime as fees get
/// bumped; the broadcaster itself only ever keeps a single live one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub id: i64,
    pub tx_id: i64,
    pub state: AttemptState,
    pub hash: B256,
    pub tx_type: TxType,
    pub signed_payload: Vec<u8>,
    /// Legacy attempts only.
    pub gas_price: Option<u128>,
    /// Dynamic-fee attempts only.
    pub gas_tip_cap: Option<u128>,
    /// Dynamic-fee attempts only.
    pub gas_fee_cap: Option<u128>,
}

impl Attempt {
    pub fn dynamic_fee(&self) -> Option<DynamicFee> {
        match (self.gas_tip_cap, self.gas_fee_cap) {
            (Some(tip_cap), Some(fee_cap)) => Some(DynamicFee { tip_cap, fee_cap }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    InProgress,
    Broadcast,
    /// Confirmer-owned; present so stored rows round-trip.
    InsufficientFunds,
}

// Used for DB storage
impl AttemptState {
    pub fn as_db(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Broadcast => "broadcast",
            Self::InsufficientFunds => "insufficient_funds",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "broadcast" => Some(Self::Broadcast),
            "insufficient_funds" => Some(Self::InsufficientFunds),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db())
    }
}

/// EIP-2718 transaction envelope type of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    Legacy,
    DynamicFee,
}

impl TxType {
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Legacy => 0x0,
            Self::DynamicFee => 0x2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Legacy),
            0x2 => Some(Self::DynamicFee),
            _ => None,
        }
    }
}

/// EIP-1559 fee pair, in wei.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicFee {
    pub tip_cap: u128,
    pub fee_cap: u128,
}

/// Fee carried by a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fee {
    Legacy { gas_price: u128 },
    Dynamic(DynamicFee),
}

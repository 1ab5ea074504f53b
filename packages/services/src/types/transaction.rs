use super::{Address, CheckerSpec, DateTime, U256, Utc};

/// A queued transaction owned by the broadcast pipeline.
///
/// Rows are created externally in `Unstarted`; the broadcaster moves them
/// through `InProgress` into either `Unconfirmed` or `FatalError`. The
/// `Confirmed` state belongs to the downstream confirmer and is never
/// written here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tx {
    pub id: i64,
    pub from_address: Address,
    pub to_address: Address,
    pub chain_id: u64,
    /// Assigned when the transaction is promoted to `InProgress`.
    pub nonce: Option<i64>,
    pub encoded_payload: Vec<u8>,
    pub gas_limit: u64,
    pub value: U256,
    pub state: TxState,
    /// Set only when the transaction fatally errors.
    pub error: Option<String>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub initial_broadcast_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub checker_spec: CheckerSpec,
    pub pipeline_task_run_id: Option<i64>,
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Unstarted,
    InProgress,
    Unconfirmed,
    FatalError,
    Confirmed,
}

// Used for DB storage
impl TxState {
    pub fn as_db(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::InProgress => "in_progress",
            Self::Unconfirmed => "unconfirmed",
            Self::FatalError => "fatal_error",
            Self::Confirmed => "confirmed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "unstarted" => Some(Self::Unstarted),
            "in_progress" => Some(Self::InProgress),
            "unconfirmed" => Some(Self::Unconfirmed),
            "fatal_error" => Some(Self::FatalError),
            "confirmed" => Some(Self::Confirmed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db())
    }
}

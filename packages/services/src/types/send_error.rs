/// Classified response from a remote-node submission.
///
/// Carries the raw node message for logging and a category tag for
/// dispatch. Nodes disagree wildly on wording, so classification is a
/// curated, case-insensitive substring match over the responses of the
/// node families we run against (geth, openethereum and the Optimism
/// lineage); anything unrecognised is `Unclassified` and treated as
/// transient by the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct SendError {
    kind: SendErrorKind,
    message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    TooExpensive,
    Fatal,
    NonceTooLow,
    TransactionAlreadyMined,
    ReplacementUnderpriced,
    TerminallyUnderpriced,
    OptimismFeeTooLow,
    OptimismFeeTooHigh,
    TemporarilyUnderpriced,
    InsufficientFunds,
    Unclassified,
}

// geth interpolates the fee: "tx fee (1.10 ether) exceeds the configured cap (1.00 ether)"
const TOO_EXPENSIVE: &[&str] = &["exceeds the configured cap"];

const FATAL: &[&str] = &[
    "invalid sender",
    "invalid chain id",
    "invalid transaction",
    "intrinsic gas too low",
    "exceeds block gas limit",
    "oversized data",
    "negative value",
    "transaction type not supported",
];

const NONCE_TOO_LOW: &[&str] = &[
    "nonce too low",
    "transaction nonce is too low",
    "invalid transaction nonce",
];

const ALREADY_MINED: &[&str] = &[
    "transaction already finalized",
    "already mined",
    "already known",
    "known transaction",
];

const REPLACEMENT_UNDERPRICED: &[&str] = &["replacement transaction underpriced"];

const TERMINALLY_UNDERPRICED: &[&str] = &["transaction underpriced"];

const OPTIMISM_FEE_TOO_LOW: &[&str] = &["fee too low"];

const OPTIMISM_FEE_TOO_HIGH: &[&str] = &["fee too high"];

const TEMPORARILY_UNDERPRICED: &[&str] = &["too many transactions in the queue"];

const INSUFFICIENT_FUNDS: &[&str] = &[
    "insufficient funds",
    "insufficient balance",
    "insufficient eth",
];

fn matches_any(message: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| message.contains(p))
}

impl SendError {
    pub fn new(kind: SendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classifies a raw node response into the closed category set.
    ///
    /// Match order matters: "replacement transaction underpriced"
    /// contains "transaction underpriced", so the more specific
    /// categories are checked first.
    pub fn classify(raw: impl Into<String>) -> Self {
        let message = raw.into();
        let lowered = message.to_lowercase();

        let kind = if matches_any(&lowered, TOO_EXPENSIVE) {
            SendErrorKind::TooExpensive
        } else if matches_any(&lowered, INSUFFICIENT_FUNDS) {
            SendErrorKind::InsufficientFunds
        } else if matches_any(&lowered, NONCE_TOO_LOW) {
            SendErrorKind::NonceTooLow
        } else if matches_any(&lowered, ALREADY_MINED) {
            SendErrorKind::TransactionAlreadyMined
        } else if matches_any(&lowered, REPLACEMENT_UNDERPRICED) {
            SendErrorKind::ReplacementUnderpriced
        } else if matches_any(&lowered, TERMINALLY_UNDERPRICED) {
            SendErrorKind::TerminallyUnderpriced
        } else if matches_any(&lowered, OPTIMISM_FEE_TOO_LOW) {
            SendErrorKind::OptimismFeeTooLow
        } else if matches_any(&lowered, OPTIMISM_FEE_TOO_HIGH) {
            SendErrorKind::OptimismFeeTooHigh
        } else if matches_any(&lowered, TEMPORARILY_UNDERPRICED) {
            SendErrorKind::TemporarilyUnderpriced
        } else if matches_any(&lowered, FATAL) {
            SendErrorKind::Fatal
        } else {
            SendErrorKind::Unclassified
        };

        Self { kind, message }
    }

    pub fn kind(&self) -> SendErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_too_expensive(&self) -> bool {
        self.kind == SendErrorKind::TooExpensive
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == SendErrorKind::Fatal
    }

    pub fn is_nonce_too_low(&self) -> bool {
        self.kind == SendErrorKind::NonceTooLow
    }

    pub fn is_tx_already_mined(&self) -> bool {
        self.kind == SendErrorKind::TransactionAlreadyMined
    }

    pub fn is_replacement_underpriced(&self) -> bool {
        self.kind == SendErrorKind::ReplacementUnderpriced
    }

    pub fn is_terminally_underpriced(&self) -> bool {
        self.kind == SendErrorKind::TerminallyUnderpriced
    }

    pub fn is_optimism_fee_too_low(&self) -> bool {
        self.kind == SendErrorKind::OptimismFeeTooLow
    }

    pub fn is_optimism_fee_too_high(&self) -> bool {
        self.kind == SendErrorKind::OptimismFeeTooHigh
    }

    pub fn is_temporarily_underpriced(&self) -> bool {
        self.kind == SendErrorKind::TemporarilyUnderpriced
    }

    pub fn is_insufficient_funds(&self) -> bool {
        self.kind == SendErrorKind::InsufficientFunds
    }

    /// The nonce is already occupied by some earlier submission; record
    /// the attempt as broadcast and let the confirmer sort out which
    /// transaction actually made it.
    pub fn assume_success(&self) -> bool {
        self.is_nonce_too_low() || self.is_tx_already_mined() || self.is_replacement_underpriced()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_geth_responses() {
        let cases = [
            (
                "tx fee (1.10 ether) exceeds the configured cap (1.00 ether)",
                SendErrorKind::TooExpensive,
            ),
            ("nonce too low", SendErrorKind::NonceTooLow),
            (
                "known transaction: 0xabc",
                SendErrorKind::TransactionAlreadyMined,
            ),
            (
                "replacement transaction underpriced",
                SendErrorKind::ReplacementUnderpriced,
            ),
            (
                "transaction underpriced: tip needed 1 gwei",
                SendErrorKind::TerminallyUnderpriced,
            ),
            (
                "insufficient funds for gas * price + value",
                SendErrorKind::InsufficientFunds,
            ),
            ("invalid sender", SendErrorKind::Fatal),
            ("exceeds block gas limit", SendErrorKind::Fatal),
        ];

        for (raw, expected) in cases {
            assert_eq!(SendError::classify(raw).kind(), expected, "{raw}");
        }
    }

    #[test]
    fn classifies_openethereum_responses() {
        assert_eq!(
            SendError::classify("Transaction nonce is too low. Try incrementing the nonce.").kind(),
            SendErrorKind::NonceTooLow,
        );
        assert_eq!(
            SendError::classify(
                "There are too many transactions in the queue. Your transaction was dropped \
                 due to limit. Try increasing the fee."
            )
            .kind(),
            SendErrorKind::TemporarilyUnderpriced,
        );
    }

    #[test]
    fn classifies_optimism_responses() {
        assert_eq!(
            SendError::classify("fee too low: 30365, use at least tx.gasPrice = 15000000").kind(),
            SendErrorKind::OptimismFeeTooLow,
        );
        assert_eq!(
            SendError::classify("fee too high: 10000000000, use less than 6000000 * 3/2").kind(),
            SendErrorKind::OptimismFeeTooHigh,
        );
    }

    #[test]
    fn replacement_wins_over_plain_underpriced() {
        // the replacement message embeds the terminal one
        let err = SendError::classify("replacement transaction underpriced");
        assert!(err.is_replacement_underpriced());
        assert!(!err.is_terminally_underpriced());
    }

    #[test]
    fn unknown_messages_are_unclassified() {
        let err = SendError::classify("connection reset by peer");
        assert_eq!(err.kind(), SendErrorKind::Unclassified);
        assert!(!err.assume_success());
    }

    #[test]
    fn assume_success_bucket() {
        assert!(SendError::classify("nonce too low").assume_success());
        assert!(SendError::classify("already known").assume_success());
        assert!(SendError::classify("replacement transaction underpriced").assume_success());
        assert!(!SendError::classify("transaction underpriced").assume_success());
    }

    #[test]
    fn classification_is_case_insensitive_but_message_is_preserved() {
        let err = SendError::classify("Nonce Too Low");
        assert!(err.is_nonce_too_low());
        assert_eq!(err.message(), "Nonce Too Low");
    }
}

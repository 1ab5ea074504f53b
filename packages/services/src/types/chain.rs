use serde::Deserialize;

/// Remote chain flavour, as far as send-error semantics are concerned.
///
/// Optimism-family L2s reject transactions whose legacy gas price does
/// not exactly match the sequencer's quote; those responses get a
/// dedicated re-estimation path instead of being fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainVariant {
    #[default]
    Standard,
    Optimism,
    Metis,
}

impl ChainVariant {
    pub fn is_optimism_clone(&self) -> bool {
        matches!(self, Self::Optimism | Self::Metis)
    }
}

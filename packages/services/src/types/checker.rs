/// Opaque pre-submit check selector stored alongside a transaction.
///
/// The broadcaster never interprets the contents; the transmit-check
/// factory does. An empty spec selects the no-op checker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckerSpec(pub Option<String>);

impl CheckerSpec {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new(spec: impl Into<String>) -> Self {
        Self(Some(spec.into()))
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

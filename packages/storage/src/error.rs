pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("database error: {0}")]
    Database(String),
    #[error("could not convert to/from domain/db type: {0}")]
    Conversion(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("transaction removed")]
    TxRemoved,
}

impl From<Error> for services::broadcaster::port::storage::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Database(e) => Self::Database(e),
            Error::Conversion(e) => Self::Conversion(e),
            Error::InvariantViolation(e) => Self::InvariantViolation(e),
            Error::TxRemoved => Self::TxRemoved,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Database(e.to_string())
    }
}

pub mod policy;
pub mod pool;
pub mod postgres;
pub mod store;
pub mod usage;

pub use policy::{IssuedPolicy, PolicyKeys, PolicyLedger, PolicyVerification, VerificationReason};
pub use pool::{CryptoPool, PoolError};
pub use postgres::PgRecordStore;
pub use store::{MemoryRecordStore, Record, RecordStore};
pub use usage::UsageLedger;

#[derive(Debug)]
pub enum LedgerError {
    Timeout,
    Sqlx(sqlx::Error),
    Duplicate { collection: String, id: String },
    Corrupt(String),
    Signing(String),
    InvalidKey(String),
}

impl LedgerError {
    /// True for failures of the record store itself.
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            LedgerError::Timeout
                | LedgerError::Sqlx(_)
                | LedgerError::Duplicate { .. }
                | LedgerError::Corrupt(_)
        )
    }
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Timeout => write!(f, "record store operation timed out"),
            LedgerError::Sqlx(err) => write!(f, "record store sql error: {}", err),
            LedgerError::Duplicate { collection, id } => {
                write!(f, "record {}/{} already exists", collection, id)
            }
            LedgerError::Corrupt(msg) => write!(f, "stored record is malformed: {}", msg),
            LedgerError::Signing(msg) => write!(f, "policy signing failed: {}", msg),
            LedgerError::InvalidKey(msg) => write!(f, "invalid policy key: {}", msg),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<sqlx::Error> for LedgerError {
    fn from(value: sqlx::Error) -> Self {
        LedgerError::Sqlx(value)
    }
}

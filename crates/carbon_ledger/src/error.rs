//! Ledger-wide error taxonomy.

use crate::amount::AmountError;
use crate::store::StoreError;
use crate::transfer::TransferError;
use crate::verify::ClassifyError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed or missing input; nothing was mutated.
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("already registered: {0}")]
    Duplicate(String),
    /// Lost the compare-and-set on a listing, or it was sold earlier.
    #[error("listing not available")]
    ListingUnavailable { listing_id: i64 },
    #[error("{service} unavailable: {detail}")]
    External {
        service: &'static str,
        detail: String,
    },
    #[error("{service} timed out after {timeout_ms}ms")]
    Timeout {
        service: &'static str,
        timeout_ms: u64,
    },
    #[error("store: {0}")]
    Store(StoreError),
}

impl LedgerError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// External failures are safe to retry by resubmitting the same claim.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::External { .. } | Self::Timeout { .. })
    }
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(what) => Self::Duplicate(what),
            other => Self::Store(other),
        }
    }
}

impl From<AmountError> for LedgerError {
    fn from(e: AmountError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<ClassifyError> for LedgerError {
    fn from(e: ClassifyError) -> Self {
        Self::External {
            service: "classifier",
            detail: e.to_string(),
        }
    }
}

impl From<TransferError> for LedgerError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::InvalidAddress(addr) => {
                Self::Validation(format!("malformed wallet address: {}", addr))
            }
            other => Self::External {
                service: "token transfer",
                detail: other.to_string(),
            },
        }
    }
}

//! carbon_ledger: carbon-credit ledger for plantation verification and certificate tokenisation.
//!
//! Credits are earned from verified plantation claims and tokenised
//! certificates, spent by consumption sensor pings, and offered as lots on a
//! marketplace. Every balance change is an appended event; the stored balance
//! is authoritative and history replay cross-checks it.

pub mod accounts;
pub mod amount;
pub mod config;
pub mod error;
pub mod ledger;
pub mod market;
pub mod sensor;
pub mod store;
pub mod transfer;
pub mod verify;

pub use accounts::{Account, NewAccount, UserId};
pub use amount::{Amount, AmountError};
pub use config::LedgerConfig;
pub use error::LedgerError;
pub use ledger::{
    fingerprint, EventKind, EventStatus, Ledger, LedgerEvent, LedgerSummary, Outcome,
    SuretyLevel, Telemetry,
};
pub use market::{ActiveListing, Listing, ListingId, Marketplace, NewListing};
pub use sensor::{SensorMonitor, SensorStatus};
pub use store::{Applied, LedgerStore, SqliteStore, StoreError};
pub use transfer::{TokenTransfer, WalletAddress};
pub use verify::{ClaimKind, Classification, Classifier};

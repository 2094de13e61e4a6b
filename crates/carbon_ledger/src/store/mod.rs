//! Storage interface for accounts, ledger events and listings.
//!
//! Every mutating method is a single atomic unit at the storage layer: an
//! event append and its balance effect commit together, and balance
//! arithmetic happens inside the store, never as a read-then-write in callers.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::accounts::{Account, AccountDraft, UserId};
use crate::amount::Amount;
use crate::ledger::events::{EventId, EventKind, EventStatus, LedgerEvent};
use crate::market::{ActiveListing, Listing, ListingDraft, ListingId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("event payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("{0}")]
    Duplicate(String),
    #[error("balance would exceed the representable range")]
    Overflow,
    #[error("store lock poisoned")]
    Poisoned,
}

/// How an appended event moves the owner's balance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalanceEffect {
    None,
    Credit,
    /// Subtract, flooring at zero, and refresh the liveness timestamp.
    DebitFloored,
}

#[derive(Clone, Debug)]
pub struct NewEvent {
    pub kind: EventKind,
    pub status: EventStatus,
    pub effect: BalanceEffect,
}

/// An event as committed together with the balance it left behind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Applied {
    pub event: LedgerEvent,
    pub balance: Amount,
}

pub trait LedgerStore: Send + Sync {
    fn insert_account(
        &self,
        draft: &AccountDraft,
        opening_balance: Amount,
        now: OffsetDateTime,
    ) -> Result<Account, StoreError>;

    fn account(&self, id: UserId) -> Result<Option<Account>, StoreError>;

    /// Returns false when the account does not exist.
    fn touch_login(&self, id: UserId, now: OffsetDateTime) -> Result<bool, StoreError>;

    fn mark_verified(&self, id: UserId) -> Result<bool, StoreError>;

    /// Append an event and apply its balance effect atomically.
    /// `Ok(None)` when the account does not exist.
    fn append_event(
        &self,
        user_id: UserId,
        event: &NewEvent,
        now: OffsetDateTime,
    ) -> Result<Option<Applied>, StoreError>;

    /// Pending → settled, crediting the issued tokens and setting the
    /// tracking-purchased flag. `Ok(None)` when the event is not pending.
    fn settle_tokenisation(
        &self,
        event_id: EventId,
        external_ref: Option<&str>,
    ) -> Result<Option<Applied>, StoreError>;

    /// Pending → failed. No balance effect.
    fn fail_tokenisation(&self, event_id: EventId) -> Result<bool, StoreError>;

    /// Full history in append order.
    fn events(&self, user_id: UserId) -> Result<Vec<LedgerEvent>, StoreError>;

    /// `Ok(None)` when the owner does not exist.
    fn insert_listing(
        &self,
        owner_id: UserId,
        draft: &ListingDraft,
        now: OffsetDateTime,
    ) -> Result<Option<Listing>, StoreError>;

    fn listing(&self, id: ListingId) -> Result<Option<Listing>, StoreError>;

    /// Unsold listings, oldest first, with the owner's handle.
    fn active_listings(&self) -> Result<Vec<ActiveListing>, StoreError>;

    fn listings_of(&self, owner_id: UserId) -> Result<Vec<Listing>, StoreError>;

    /// Compare-and-set unsold → sold. True only for the single winning caller.
    fn mark_sold(
        &self,
        listing_id: ListingId,
        buyer_id: UserId,
        now: OffsetDateTime,
    ) -> Result<bool, StoreError>;
}

//! Marketplace: credit-lot listings and the at-most-once buy transition.
//!
//! A purchase only flips the listing to sold; no credits move between buyer
//! and seller. Settlement of the lot happens outside the ledger.

use crate::accounts::UserId;
use crate::amount::Amount;
use crate::error::LedgerError;
use crate::store::LedgerStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};

pub type ListingId = i64;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub owner_id: UserId,
    pub title: String,
    pub description: String,
    pub quantity: Amount,
    pub unit_price: Amount,
    pub sold: bool,
    pub buyer_id: Option<UserId>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub sold_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Browse-view row: an unsold listing plus the owner's display handle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveListing {
    #[serde(flatten)]
    pub listing: Listing,
    /// None when the owner account no longer resolves.
    pub owner_handle: Option<String>,
}

/// Listing request as received at the boundary. Amounts accept decimal
/// strings or JSON numbers.
#[derive(Clone, Debug, Deserialize)]
pub struct NewListing {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub quantity: Amount,
    #[serde(alias = "priceCC", alias = "price")]
    pub unit_price: Amount,
}

/// Validated listing, ready to persist.
#[derive(Clone, Debug, PartialEq)]
pub struct ListingDraft {
    pub title: String,
    pub description: String,
    pub quantity: Amount,
    pub unit_price: Amount,
}

impl NewListing {
    pub fn validate(&self) -> Result<ListingDraft, LedgerError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(LedgerError::Validation("title is required".into()));
        }
        if self.quantity.is_zero() {
            return Err(LedgerError::Validation("quantity must be greater than zero".into()));
        }
        Ok(ListingDraft {
            title: title.to_string(),
            description: self.description.as_deref().unwrap_or("").trim().to_string(),
            quantity: self.quantity,
            unit_price: self.unit_price,
        })
    }
}

pub struct Marketplace {
    store: Arc<dyn LedgerStore>,
}

impl Marketplace {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn create_listing(
        &self,
        owner_id: UserId,
        request: &NewListing,
    ) -> Result<Listing, LedgerError> {
        let draft = request.validate()?;
        let listing = self
            .store
            .insert_listing(owner_id, &draft, OffsetDateTime::now_utc())?
            .ok_or_else(|| LedgerError::not_found("user", owner_id))?;
        info!(listing_id = listing.id, owner_id, quantity = %listing.quantity, "listing created");
        Ok(listing)
    }

    pub fn list_active(&self) -> Result<Vec<ActiveListing>, LedgerError> {
        Ok(self.store.active_listings()?)
    }

    /// Listings created by `owner_id`, sold or not.
    pub fn listings_of(&self, owner_id: UserId) -> Result<Vec<Listing>, LedgerError> {
        if self.store.account(owner_id)?.is_none() {
            return Err(LedgerError::not_found("user", owner_id));
        }
        Ok(self.store.listings_of(owner_id)?)
    }

    /// Mark the listing sold to `buyer_id`. Of any number of concurrent calls
    /// on one listing, exactly one succeeds; the rest get `ListingUnavailable`.
    pub fn buy(&self, listing_id: ListingId, buyer_id: UserId) -> Result<Listing, LedgerError> {
        if self.store.account(buyer_id)?.is_none() {
            return Err(LedgerError::not_found("user", buyer_id));
        }
        if !self
            .store
            .mark_sold(listing_id, buyer_id, OffsetDateTime::now_utc())?
        {
            return match self.store.listing(listing_id)? {
                None => Err(LedgerError::not_found("listing", listing_id)),
                Some(_) => {
                    warn!(listing_id, buyer_id, "purchase lost: listing not available");
                    Err(LedgerError::ListingUnavailable { listing_id })
                }
            };
        }
        let listing = self
            .store
            .listing(listing_id)?
            .ok_or_else(|| LedgerError::not_found("listing", listing_id))?;
        info!(listing_id, buyer_id, "listing sold");
        Ok(listing)
    }
}

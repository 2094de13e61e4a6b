//! Account records and registration input.

use crate::amount::Amount;
use crate::error::LedgerError;
use crate::transfer::WalletAddress;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type UserId = i64;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub id: UserId,
    pub email: String,
    pub handle: String,
    pub wallet: Option<WalletAddress>,
    pub balance: Amount,
    /// Balance granted at registration; the replay baseline.
    pub opening_balance: Amount,
    pub verified: bool,
    pub tracking_purchased: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_ping: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_login_at: OffsetDateTime,
}

/// Registration input as handed over by the auth collaborator.
#[derive(Clone, Debug, Deserialize)]
pub struct NewAccount {
    pub email: String,
    pub handle: String,
    /// Opaque hash; credentials are never seen in clear here.
    pub credential_hash: String,
    #[serde(default)]
    pub wallet: Option<String>,
}

/// Validated registration, ready to persist.
#[derive(Clone, Debug)]
pub struct AccountDraft {
    pub email: String,
    pub handle: String,
    pub credential_hash: String,
    pub wallet: Option<WalletAddress>,
}

impl NewAccount {
    pub fn validate(&self) -> Result<AccountDraft, LedgerError> {
        let email = self.email.trim().to_lowercase();
        let well_formed = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !well_formed {
            return Err(LedgerError::Validation(format!("invalid email: {}", self.email)));
        }
        let handle = self.handle.trim();
        if handle.is_empty() {
            return Err(LedgerError::Validation("handle is required".into()));
        }
        if self.credential_hash.trim().is_empty() {
            return Err(LedgerError::Validation("credential hash is required".into()));
        }
        let wallet = match self.wallet.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(w) => Some(WalletAddress::parse(w)?),
        };
        Ok(AccountDraft {
            email,
            handle: handle.to_string(),
            credential_hash: self.credential_hash.clone(),
            wallet,
        })
    }
}

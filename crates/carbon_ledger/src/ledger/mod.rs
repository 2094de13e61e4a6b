//! Credit ledger: every balance change goes through here.

mod digest;
pub mod events;
mod summary;

pub use digest::{fingerprint, normalize_for_hash};
pub use events::{EventId, EventKind, EventStatus, LedgerEvent, SuretyLevel};
pub use summary::{compute_summary, compute_telemetry, replay_balance, LedgerSummary, Telemetry};

use crate::accounts::{Account, NewAccount, UserId};
use crate::amount::Amount;
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::store::{Applied, BalanceEffect, LedgerStore, NewEvent, SqliteStore};
use crate::transfer::{HttpTokenTransfer, LedgerOnlyTransfer, TokenTransfer};
use crate::verify::{
    evaluate_certificate, evaluate_plantation, ClaimKind, Claim, Classifier, HttpClassifier,
    Rejection,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{error, info, warn};

const UNKNOWN_SOURCE: &str = "Unknown";

/// Result of submitting a claim. A rejection is a business outcome, not an error.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Accepted(Box<Applied>),
    Rejected(Rejection),
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    classifier: Arc<dyn Classifier>,
    transfer: Arc<dyn TokenTransfer>,
    config: LedgerConfig,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        classifier: Arc<dyn Classifier>,
        transfer: Arc<dyn TokenTransfer>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            transfer,
            config,
        }
    }

    /// Wire the SQLite store and HTTP collaborators described by `config`.
    pub fn open(config: LedgerConfig) -> Result<Self, LedgerError> {
        let store = SqliteStore::open(&config.database_path)?;
        let classifier = HttpClassifier::new(&config.classifier)?;
        let transfer: Arc<dyn TokenTransfer> = match config.transfer.base_url.as_deref() {
            Some(url) => Arc::new(HttpTokenTransfer::new(url, config.transfer.timeout())?),
            None => Arc::new(LedgerOnlyTransfer),
        };
        info!(db = %config.database_path.display(), "ledger opened");
        Ok(Self::new(Arc::new(store), Arc::new(classifier), transfer, config))
    }

    /// Shared handle to the store, e.g. for a [`crate::market::Marketplace`].
    pub fn store(&self) -> Arc<dyn LedgerStore> {
        Arc::clone(&self.store)
    }

    pub fn create_account(&self, request: &NewAccount) -> Result<Account, LedgerError> {
        let draft = request.validate()?;
        Ok(self.store.insert_account(
            &draft,
            self.config.initial_balance,
            OffsetDateTime::now_utc(),
        )?)
    }

    pub fn account(&self, user_id: UserId) -> Result<Account, LedgerError> {
        self.store
            .account(user_id)?
            .ok_or_else(|| LedgerError::not_found("user", user_id))
    }

    pub fn record_login(&self, user_id: UserId) -> Result<(), LedgerError> {
        if !self.store.touch_login(user_id, OffsetDateTime::now_utc())? {
            return Err(LedgerError::not_found("user", user_id));
        }
        Ok(())
    }

    pub fn mark_verified(&self, user_id: UserId) -> Result<(), LedgerError> {
        if !self.store.mark_verified(user_id)? {
            return Err(LedgerError::not_found("user", user_id));
        }
        Ok(())
    }

    pub fn history(&self, user_id: UserId) -> Result<Vec<LedgerEvent>, LedgerError> {
        self.account(user_id)?;
        Ok(self.store.events(user_id)?)
    }

    /// Credit an accepted plantation claim. Rejected claims are logged, never persisted.
    pub fn apply_verification(
        &self,
        user_id: UserId,
        claim: &Claim,
    ) -> Result<Outcome, LedgerError> {
        self.account(user_id)?;
        let award = match evaluate_plantation(claim) {
            Ok(award) => award,
            Err(rejection) => {
                info!(user_id, confidence = claim.confidence(), reason = %rejection, "plantation claim rejected");
                return Ok(Outcome::Rejected(rejection));
            }
        };
        let event = NewEvent {
            kind: EventKind::Plantation {
                location: award.location,
                estimated_saplings: award.estimated_saplings,
                size_in_acres: award.size_in_acres,
                monetary_amount: award.monetary_amount,
                awarded: award.awarded,
                confidence: claim.confidence(),
                surety: award.surety,
                raw_text: claim.raw_text.clone(),
                text_sha256: claim.text_sha256(),
            },
            status: EventStatus::Settled,
            effect: BalanceEffect::Credit,
        };
        let applied = self
            .store
            .append_event(user_id, &event, OffsetDateTime::now_utc())?
            .ok_or_else(|| LedgerError::not_found("user", user_id))?;
        info!(user_id, awarded = %award.awarded, balance = %applied.balance, "plantation verified");
        Ok(Outcome::Accepted(Box::new(applied)))
    }

    /// Issue tokens for an accepted certificate claim.
    ///
    /// The event is recorded as pending first, then mirrored to the account's
    /// wallet (if any); only a successful transfer settles it and credits the
    /// balance. A failed or timed-out transfer leaves the balance untouched.
    pub async fn apply_tokenisation(
        &self,
        user_id: UserId,
        claim: &Claim,
        source: &str,
    ) -> Result<Outcome, LedgerError> {
        let account = self.account(user_id)?;
        let award = match evaluate_certificate(claim) {
            Ok(award) => award,
            Err(rejection) => {
                info!(user_id, confidence = claim.confidence(), reason = %rejection, "certificate claim rejected");
                return Ok(Outcome::Rejected(rejection));
            }
        };
        if account.balance.checked_add(award.tokens_issued).is_none() {
            return Err(LedgerError::Validation(
                "issued tokens would overflow the balance".into(),
            ));
        }
        let source = match source.trim() {
            "" => UNKNOWN_SOURCE.to_string(),
            s => s.to_string(),
        };
        let pending = NewEvent {
            kind: EventKind::Tokenisation {
                carbon_credits: award.carbon_credits,
                tokens_issued: award.tokens_issued,
                source,
                confidence: claim.confidence(),
            },
            status: EventStatus::Pending,
            effect: BalanceEffect::None,
        };
        let event_id = self
            .store
            .append_event(user_id, &pending, OffsetDateTime::now_utc())?
            .ok_or_else(|| LedgerError::not_found("user", user_id))?
            .event
            .id;

        let reference = match &account.wallet {
            None => None,
            Some(wallet) => {
                let timeout = self.config.transfer.timeout();
                match tokio::time::timeout(
                    timeout,
                    self.transfer.transfer(wallet, award.tokens_issued),
                )
                .await
                {
                    Ok(Ok(receipt)) => receipt.reference,
                    Ok(Err(e)) => {
                        warn!(user_id, event_id, error = %e, "token transfer failed");
                        self.abandon_tokenisation(event_id);
                        return Err(e.into());
                    }
                    Err(_) => {
                        warn!(user_id, event_id, "token transfer timed out");
                        self.abandon_tokenisation(event_id);
                        return Err(LedgerError::Timeout {
                            service: "token transfer",
                            timeout_ms: self.config.transfer.timeout_ms,
                        });
                    }
                }
            }
        };

        match self.store.settle_tokenisation(event_id, reference.as_deref()) {
            Ok(Some(applied)) => {
                info!(user_id, event_id, issued = %award.tokens_issued, balance = %applied.balance, "certificate tokenised");
                Ok(Outcome::Accepted(Box::new(applied)))
            }
            Ok(None) => Err(LedgerError::not_found("pending tokenisation", event_id)),
            Err(e) => {
                if reference.is_some() {
                    error!(user_id, event_id, reference = ?reference, "transfer executed but settlement failed; reconcile manually");
                }
                self.abandon_tokenisation(event_id);
                Err(e.into())
            }
        }
    }

    fn abandon_tokenisation(&self, event_id: EventId) {
        if let Err(e) = self.store.fail_tokenisation(event_id) {
            error!(event_id, error = %e, "could not mark tokenisation failed");
        }
    }

    /// Debit a consumption reading, flooring the balance at zero, and refresh liveness.
    pub fn apply_consumption(
        &self,
        user_id: UserId,
        credits_used: Amount,
    ) -> Result<Applied, LedgerError> {
        if credits_used.is_zero() {
            return Err(LedgerError::Validation(
                "credits used must be greater than zero".into(),
            ));
        }
        let event = NewEvent {
            kind: EventKind::Consumption { credits_used },
            status: EventStatus::Settled,
            effect: BalanceEffect::DebitFloored,
        };
        let applied = self
            .store
            .append_event(user_id, &event, OffsetDateTime::now_utc())?
            .ok_or_else(|| LedgerError::not_found("user", user_id))?;
        info!(user_id, %credits_used, balance = %applied.balance, "consumption applied");
        Ok(applied)
    }

    pub fn get_summary(
        &self,
        user_id: UserId,
        now: OffsetDateTime,
    ) -> Result<LedgerSummary, LedgerError> {
        let account = self.account(user_id)?;
        let events = self.store.events(user_id)?;
        let summary = compute_summary(&account, &events, now);
        if !summary.balance_consistent {
            warn!(user_id, balance = %account.balance, "stored balance disagrees with replayed history");
        }
        Ok(summary)
    }

    pub fn telemetry(&self, user_id: UserId, now: OffsetDateTime) -> Result<Telemetry, LedgerError> {
        let account = self.account(user_id)?;
        let events = self.store.events(user_id)?;
        Ok(compute_telemetry(&account, &events, now))
    }

    /// Run OCR text through the classifier under the configured timeout.
    pub async fn classify(&self, text: &str, kind: ClaimKind) -> Result<Claim, LedgerError> {
        if text.trim().is_empty() {
            return Err(LedgerError::Validation("OCR text is empty".into()));
        }
        let classification =
            tokio::time::timeout(self.config.classifier.timeout(), self.classifier.classify(text, kind))
                .await
                .map_err(|_| LedgerError::Timeout {
                    service: "classifier",
                    timeout_ms: self.config.classifier.timeout_ms,
                })??;
        Ok(Claim::new(kind, text, classification))
    }

    pub async fn verify_plantation(
        &self,
        user_id: UserId,
        ocr_text: &str,
    ) -> Result<Outcome, LedgerError> {
        self.account(user_id)?;
        let claim = self.classify(ocr_text, ClaimKind::Plantation).await?;
        self.apply_verification(user_id, &claim)
    }

    pub async fn tokenise_certificate(
        &self,
        user_id: UserId,
        ocr_text: &str,
        source: Option<&str>,
    ) -> Result<Outcome, LedgerError> {
        self.account(user_id)?;
        let claim = self.classify(ocr_text, ClaimKind::Certificate).await?;
        self.apply_tokenisation(user_id, &claim, source.unwrap_or(UNKNOWN_SOURCE))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::{parse_classifier_output, Classification, ClassifyError};
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl Classifier for Unreachable {
        async fn classify(&self, _: &str, _: ClaimKind) -> Result<Classification, ClassifyError> {
            Err(ClassifyError::Api(503, "down".into()))
        }
    }

    fn ledger(initial: u64) -> Ledger {
        Ledger::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(Unreachable),
            Arc::new(LedgerOnlyTransfer),
            LedgerConfig {
                initial_balance: Amount::from_whole(initial).unwrap(),
                ..Default::default()
            },
        )
    }

    fn user(ledger: &Ledger) -> UserId {
        ledger
            .create_account(&NewAccount {
                email: "u@grove.io".into(),
                handle: "u".into(),
                credential_hash: "h".into(),
                wallet: None,
            })
            .unwrap()
            .id
    }

    fn claim(kind: ClaimKind, raw: &str) -> Claim {
        Claim::new(kind, "ocr", parse_classifier_output(raw))
    }

    #[test]
    fn opening_balance_from_config() {
        let l = ledger(50);
        let id = user(&l);
        let acct = l.account(id).unwrap();
        assert_eq!(acct.balance, Amount::from_whole(50).unwrap());
        assert!(l.get_summary(id, OffsetDateTime::now_utc()).unwrap().balance_consistent);
    }

    #[test]
    fn outcome_is_tagged() {
        let l = ledger(0);
        let id = user(&l);
        let ok = l
            .apply_verification(
                id,
                &claim(ClaimKind::Plantation, r#"{"confidence":0.96,"location":"Pune","carbonCredits":"2.5"}"#),
            )
            .unwrap();
        assert!(ok.is_accepted());
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["outcome"], "accepted");
        assert_eq!(json["balance"], "2.5");
        assert_eq!(json["event"]["kind"]["surety"], "Verified");

        let no = l
            .apply_verification(id, &claim(ClaimKind::Plantation, r#"{"confidence":0.5}"#))
            .unwrap();
        assert!(!no.is_accepted());
        let json = serde_json::to_value(&no).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["reason"], "missing field: location");
    }

    #[test]
    fn zero_consumption_rejected() {
        let l = ledger(10);
        let id = user(&l);
        assert!(matches!(
            l.apply_consumption(id, Amount::ZERO),
            Err(LedgerError::Validation(_))
        ));
        assert!(l.history(id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn tokenisation_without_wallet_settles_locally() {
        let l = ledger(0);
        let id = user(&l);
        let outcome = l
            .apply_tokenisation(
                id,
                &claim(ClaimKind::Certificate, r#"{"confidence":0.8,"carbonCredits":5}"#),
                "  ",
            )
            .await
            .unwrap();
        let Outcome::Accepted(applied) = outcome else {
            panic!("rejected");
        };
        assert_eq!(applied.balance, Amount::from_whole(500).unwrap());
        assert!(applied.event.external_ref.is_none());
        match &applied.event.kind {
            EventKind::Tokenisation { source, .. } => assert_eq!(source, UNKNOWN_SOURCE),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn tokenisation_overflow_rejected_before_append() {
        let l = ledger(9_000_000_000);
        let id = user(&l);
        let err = l
            .apply_tokenisation(
                id,
                &claim(ClaimKind::Certificate, r#"{"confidence":0.9,"carbonCredits":3000000}"#),
                "Verra",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert!(l.history(id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn classifier_outage_is_external() {
        let l = ledger(0);
        let id = user(&l);
        let err = l.verify_plantation(id, "receipt").await.unwrap_err();
        assert!(matches!(err, LedgerError::External { service: "classifier", .. }));
        assert!(err.is_retryable());
        assert!(matches!(
            l.verify_plantation(id, "   ").await,
            Err(LedgerError::Validation(_))
        ));
    }
}

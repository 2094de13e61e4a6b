//! Token-transfer collaborator: mirrors issued tokens to an external wallet.

use crate::amount::Amount;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("malformed wallet address: {0}")]
    InvalidAddress(String),
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("api error: status {0} body {1}")]
    Api(u16, String),
    #[error("transfer rejected: {0}")]
    Rejected(String),
}

/// External chain address: `0x` followed by 40 hex digits, stored lowercase.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn parse(s: &str) -> Result<Self, TransferError> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| TransferError::InvalidAddress(trimmed.to_string()))?;
        if digits.len() != 40 || hex::decode(digits).is_err() {
            return Err(TransferError::InvalidAddress(trimmed.to_string()));
        }
        Ok(Self(format!("0x{}", digits.to_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = TransferError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(w: WalletAddress) -> Self {
        w.0
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// Transaction hash or service-side id, when the service returns one.
    pub reference: Option<String>,
}

#[async_trait]
pub trait TokenTransfer: Send + Sync {
    async fn transfer(
        &self,
        to: &WalletAddress,
        amount: Amount,
    ) -> Result<TransferReceipt, TransferError>;
}

/// Keeps tokens on the internal ledger only. Used when no transfer service is configured.
#[derive(Clone, Debug, Default)]
pub struct LedgerOnlyTransfer;

#[async_trait]
impl TokenTransfer for LedgerOnlyTransfer {
    async fn transfer(
        &self,
        to: &WalletAddress,
        amount: Amount,
    ) -> Result<TransferReceipt, TransferError> {
        warn!(wallet = %to, %amount, "no transfer service configured; tokens not mirrored");
        Ok(TransferReceipt::default())
    }
}

#[derive(Serialize)]
struct TransferRequest<'a> {
    to: &'a str,
    amount: Amount,
}

/// Rejection reason for a 2xx reply whose body is not a transfer result.
pub const UNREADABLE_RESPONSE: &str = "unreadable transfer response";

#[derive(Deserialize)]
struct TransferResponse {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default, alias = "txHash", alias = "transactionHash")]
    tx_hash: Option<String>,
    #[serde(default, alias = "error")]
    reason: Option<String>,
}

fn default_true() -> bool {
    true
}

/// HTTP transfer client: `POST {base}/transfers` with `{"to", "amount"}`.
///
/// Never retried: a transfer that reached the service may have been executed.
pub struct HttpTokenTransfer {
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpTokenTransfer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransferError> {
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;
        let endpoint = base.join("transfers")?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl TokenTransfer for HttpTokenTransfer {
    async fn transfer(
        &self,
        to: &WalletAddress,
        amount: Amount,
    ) -> Result<TransferReceipt, TransferError> {
        let body = TransferRequest {
            to: to.as_str(),
            amount,
        };
        let res = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(TransferError::Api(status.as_u16(), text));
        }
        let text = res.text().await?;
        let parsed = if text.trim().is_empty() {
            TransferResponse {
                success: true,
                tx_hash: None,
                reason: None,
            }
        } else {
            match serde_json::from_str::<TransferResponse>(&text) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(wallet = %to, %amount, status = status.as_u16(), error = %e, "unreadable transfer response");
                    return Err(TransferError::Rejected(UNREADABLE_RESPONSE.to_string()));
                }
            }
        };
        if !parsed.success {
            return Err(TransferError::Rejected(
                parsed.reason.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        info!(wallet = %to, %amount, tx = ?parsed.tx_hash, "tokens transferred");
        Ok(TransferReceipt {
            reference: parsed.tx_hash,
        })
    }
}

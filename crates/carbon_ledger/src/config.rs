//! Runtime configuration for the ledger process.
//!
//! Load from: env `CARBON_LEDGER_CONFIG_PATH`, or `./config/carbon_ledger.json`,
//! or `./carbon_ledger.json`. Missing keys fall back to defaults. Policy
//! constants (acceptance threshold, token multiplier, liveness window) are not
//! configurable; see [`crate::verify::policy`] and [`crate::sensor`].

use crate::amount::Amount;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const CONFIG_PATH_ENV: &str = "CARBON_LEDGER_CONFIG_PATH";
pub const CLASSIFIER_KEY_ENV: &str = "CARBON_LEDGER_CLASSIFIER_KEY";

const DEFAULT_DATABASE_PATH: &str = "./data/carbon_ledger.sqlite";
const DEFAULT_CLASSIFIER_URL: &str = "http://127.0.0.1:8787";
const CLASSIFIER_TIMEOUT_MS: u64 = 20_000;
const TRANSFER_TIMEOUT_MS: u64 = 30_000;
const MAX_RETRIES: u32 = 2;
const RETRY_BACKOFF_MS: u64 = 500;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub database_path: PathBuf,
    /// Balance credited to every new account.
    pub initial_balance: Amount,
    pub classifier: ClassifierConfig,
    pub transfer: TransferConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub base_url: String,
    /// Bearer token. Usually supplied via `CARBON_LEDGER_CLASSIFIER_KEY` instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Token-transfer service. When unset, tokens stay on the internal ledger only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            initial_balance: Amount::ZERO,
            classifier: ClassifierConfig::default(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CLASSIFIER_URL.to_string(),
            api_key: None,
            timeout_ms: CLASSIFIER_TIMEOUT_MS,
            max_retries: MAX_RETRIES,
            retry_backoff_ms: RETRY_BACKOFF_MS,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: TRANSFER_TIMEOUT_MS,
        }
    }
}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl TransferConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl LedgerConfig {
    /// Load config from path. Returns defaults on a missing or unreadable file.
    pub fn load_from_path(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring malformed config");
                Self::default()
            }
        }
    }

    /// Load config: env path, then ./config/carbon_ledger.json, then ./carbon_ledger.json.
    /// The classifier key env var overrides any key in the file.
    pub fn load() -> Self {
        let mut config = Self::locate()
            .map(|p| Self::load_from_path(&p))
            .unwrap_or_default();
        if let Ok(key) = std::env::var(CLASSIFIER_KEY_ENV) {
            if !key.trim().is_empty() {
                config.classifier.api_key = Some(key);
            }
        }
        config
    }

    fn locate() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let p = PathBuf::from(path);
            if p.exists() {
                return Some(p);
            }
        }
        [
            Path::new("./config/carbon_ledger.json"),
            Path::new("./carbon_ledger.json"),
        ]
        .into_iter()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut f = NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{"initial_balance":"50","classifier":{{"base_url":"http://ocr.local"}}}}"#
        )
        .unwrap();
        let config = LedgerConfig::load_from_path(f.path());
        assert_eq!(config.initial_balance, Amount::from_whole(50).unwrap());
        assert_eq!(config.classifier.base_url, "http://ocr.local");
        assert_eq!(config.classifier.timeout_ms, CLASSIFIER_TIMEOUT_MS);
        assert!(config.transfer.base_url.is_none());
    }

    #[test]
    fn malformed_file_falls_back() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "not json").unwrap();
        let config = LedgerConfig::load_from_path(f.path());
        assert_eq!(config.initial_balance, Amount::ZERO);
        assert_eq!(config.database_path, PathBuf::from(DEFAULT_DATABASE_PATH));
    }

    #[test]
    fn missing_file_falls_back() {
        let config = LedgerConfig::load_from_path(Path::new("/nonexistent/carbon.json"));
        assert_eq!(config.transfer.timeout_ms, TRANSFER_TIMEOUT_MS);
    }
}

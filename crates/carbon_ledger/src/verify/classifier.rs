//! OCR-text classifier client and defensive output parsing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::ClassifierConfig;

pub const MALFORMED_REASON: &str = "classifier output malformed";

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("api error: status {0} body {1}")]
    Api(u16, String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    /// Plantation receipt: saplings bought, location, estimated credits.
    Plantation,
    /// Externally issued carbon-credit certificate.
    Certificate,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Always within [0, 1].
    pub confidence: f64,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub reason: String,
}

impl Classification {
    pub fn malformed() -> Self {
        Self {
            confidence: 0.0,
            fields: serde_json::Map::new(),
            reason: MALFORMED_REASON.to_string(),
        }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify raw OCR text. Transport failures are errors; unusable output is
    /// a zero-confidence [`Classification`], never an error.
    async fn classify(&self, text: &str, kind: ClaimKind) -> Result<Classification, ClassifyError>;
}

/// Parse free-form classifier output. Accepts bare JSON, JSON inside a fenced
/// code block, or JSON embedded in prose (first `{` to last `}`).
pub fn parse_classifier_output(raw: &str) -> Classification {
    let Some(mut object) = extract_object(raw) else {
        return Classification::malformed();
    };
    let confidence = match object.remove("confidence").as_ref().and_then(confidence_of) {
        Some(c) => c,
        None => return Classification::malformed(),
    };
    let reason = match object.remove("reason") {
        Some(serde_json::Value::String(s)) => s,
        _ => String::new(),
    };
    Classification {
        confidence,
        fields: object,
        reason,
    }
}

fn extract_object(raw: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let trimmed = raw.trim();
    if let Ok(serde_json::Value::Object(m)) = serde_json::from_str(trimmed) {
        return Some(m);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&trimmed[start..=end]) {
        Ok(serde_json::Value::Object(m)) => Some(m),
        _ => None,
    }
}

fn confidence_of(v: &serde_json::Value) -> Option<f64> {
    let c = match v {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    (c.is_finite() && (0.0..=1.0).contains(&c)).then_some(c)
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
    kind: ClaimKind,
}

/// HTTP classifier: `POST {base}/classify` with `{"text", "kind"}`; the response
/// body is handed to [`parse_classifier_output`] as-is.
pub struct HttpClassifier {
    endpoint: Url,
    api_key: Option<String>,
    client: reqwest::Client,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl HttpClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, ClassifyError> {
        let base = Url::parse(&format!("{}/", config.base_url.trim_end_matches('/')))?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            endpoint: base.join("classify")?,
            api_key: config.api_key.clone(),
            client,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
        })
    }
}

/// Exponential backoff before retry `attempt + 1`, saturating at `u64::MAX`.
fn backoff_ms(base: u64, attempt: u32) -> u64 {
    base.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, text: &str, kind: ClaimKind) -> Result<Classification, ClassifyError> {
        let body = ClassifyRequest { text, kind };
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            let mut req = self.client.post(self.endpoint.clone()).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            match req.send().await {
                Ok(r) if r.status().is_success() => match r.text().await {
                    Ok(text) => {
                        let parsed = parse_classifier_output(&text);
                        debug!(?kind, confidence = parsed.confidence, "classified");
                        return Ok(parsed);
                    }
                    // Body cut off mid-read: transport failure, not classifier output.
                    Err(e) => last_err = Some(ClassifyError::Request(e)),
                },
                Ok(r) => {
                    let status = r.status();
                    let text = r.text().await.unwrap_or_default();
                    let retryable = status.is_server_error() || status.as_u16() == 429;
                    last_err = Some(ClassifyError::Api(status.as_u16(), text));
                    if !retryable {
                        break;
                    }
                }
                Err(e) => {
                    last_err = Some(ClassifyError::Request(e));
                }
            }
            if attempt < self.max_retries {
                let ms = backoff_ms(self.retry_backoff_ms, attempt);
                warn!(attempt, ms, "classifier retry after error");
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
        Err(last_err.unwrap_or(ClassifyError::Api(0, "unknown".to_string())))
    }
}

//! Acceptance policy shared by plantation and certificate claims.

use crate::amount::Amount;
use crate::ledger::events::SuretyLevel;
use crate::verify::classifier::{ClaimKind, Classification};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Minimum classifier confidence for any claim to move a balance.
pub const ACCEPTANCE_THRESHOLD: f64 = 0.75;
/// Tokens issued per certified carbon credit.
pub const TOKEN_MULTIPLIER: u64 = 100;

pub const BELOW_THRESHOLD: &str = "confidence below threshold";

/// Classified OCR submission awaiting a policy decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claim {
    pub kind: ClaimKind,
    pub raw_text: String,
    pub classification: Classification,
}

impl Claim {
    pub fn new(kind: ClaimKind, raw_text: impl Into<String>, classification: Classification) -> Self {
        Self {
            kind,
            raw_text: raw_text.into(),
            classification,
        }
    }

    pub fn confidence(&self) -> f64 {
        self.classification.confidence
    }

    pub fn text_sha256(&self) -> String {
        hex::encode(Sha256::digest(self.raw_text.as_bytes()))
    }
}

/// A business-rule "no", reported to the submitter as-is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlantationAward {
    pub location: String,
    pub estimated_saplings: Option<u64>,
    pub size_in_acres: Option<Amount>,
    pub monetary_amount: Option<Amount>,
    pub awarded: Amount,
    pub surety: SuretyLevel,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CertificateAward {
    pub carbon_credits: Amount,
    pub tokens_issued: Amount,
}

/// Field lookup tolerant of camelCase and snake_case keys.
fn field<'a>(claim: &'a Claim, names: &[&str]) -> Option<&'a serde_json::Value> {
    names
        .iter()
        .find_map(|n| claim.classification.fields.get(*n))
        .filter(|v| !v.is_null())
}

fn required_amount(claim: &Claim, names: &[&str]) -> Result<Amount, Rejection> {
    let v = field(claim, names).ok_or_else(|| Rejection::new(format!("missing field: {}", names[0])))?;
    Amount::from_json(v).map_err(|e| Rejection::new(format!("invalid {}: {}", names[0], e)))
}

fn optional_amount(claim: &Claim, names: &[&str]) -> Result<Option<Amount>, Rejection> {
    field(claim, names)
        .map(|v| {
            Amount::from_json(v).map_err(|e| Rejection::new(format!("invalid {}: {}", names[0], e)))
        })
        .transpose()
}

fn check_confidence(claim: &Claim) -> Result<(), Rejection> {
    if claim.confidence() < ACCEPTANCE_THRESHOLD {
        return Err(Rejection::new(BELOW_THRESHOLD));
    }
    Ok(())
}

fn check_kind(claim: &Claim, expected: ClaimKind) -> Result<(), Rejection> {
    if claim.kind != expected {
        return Err(Rejection::new(format!(
            "expected a {:?} claim, got {:?}",
            expected, claim.kind
        )));
    }
    Ok(())
}

/// Field validation runs first so an invalid claim is rejected regardless of confidence.
pub fn evaluate_plantation(claim: &Claim) -> Result<PlantationAward, Rejection> {
    check_kind(claim, ClaimKind::Plantation)?;
    let location = match field(claim, &["location"]) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(_) => return Err(Rejection::new("invalid location")),
        None => return Err(Rejection::new("missing field: location")),
    };
    let awarded = required_amount(claim, &["carbonCredits", "carbon_credits"])?;
    let estimated_saplings = optional_amount(claim, &["estimatedSaplings", "estimated_saplings"])?
        .map(|a| {
            if a.nanos() % crate::amount::UNIT != 0 {
                return Err(Rejection::new("invalid estimatedSaplings: not a whole number"));
            }
            Ok(a.nanos() / crate::amount::UNIT)
        })
        .transpose()?;
    let size_in_acres = optional_amount(claim, &["sizeInAcres", "size_in_acres"])?;
    let monetary_amount = optional_amount(claim, &["amount", "monetaryAmount"])?;
    check_confidence(claim)?;
    if awarded.is_zero() {
        return Err(Rejection::new("claim carries no credits"));
    }
    Ok(PlantationAward {
        location,
        estimated_saplings,
        size_in_acres,
        monetary_amount,
        awarded,
        surety: SuretyLevel::from_confidence(claim.confidence()),
    })
}

pub fn evaluate_certificate(claim: &Claim) -> Result<CertificateAward, Rejection> {
    check_kind(claim, ClaimKind::Certificate)?;
    let carbon_credits = required_amount(claim, &["carbonCredits", "carbon_credits"])?;
    check_confidence(claim)?;
    if carbon_credits.is_zero() {
        return Err(Rejection::new("certificate carries no credits"));
    }
    let tokens_issued = carbon_credits
        .checked_mul(TOKEN_MULTIPLIER)
        .ok_or_else(|| Rejection::new("invalid carbonCredits: amount out of range"))?;
    Ok(CertificateAward {
        carbon_credits,
        tokens_issued,
    })
}

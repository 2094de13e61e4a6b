//! Verifier integration: classifier client, output parsing and acceptance policy.

mod classifier;
pub mod policy;

pub use classifier::{
    parse_classifier_output, ClaimKind, Classification, Classifier, ClassifyError, HttpClassifier,
    MALFORMED_REASON,
};
pub use policy::{
    evaluate_certificate, evaluate_plantation, CertificateAward, Claim, PlantationAward,
    Rejection, ACCEPTANCE_THRESHOLD, TOKEN_MULTIPLIER,
};

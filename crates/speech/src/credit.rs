//! Billing-failure classification for speech vendors.
//!
//! Vendors do not share an error code for "out of credit", so this is a substring
//! match over the error text. It decides when the sticky fallback flag trips and is
//! expected to be replaced once a provider offers a structured signal.

pub const CREDIT_INDICATORS: &[&str] = &[
    "insufficient",
    "credit",
    "balance",
    "quota",
    "limit exceeded",
    "payment required",
    "402",
];

pub fn looks_like_credit_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    CREDIT_INDICATORS.iter().any(|i| lower.contains(i))
}

/// Classifies an error chain coming back through the speech traits.
pub fn is_credit_failure(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|e| e.downcast_ref::<crate::SpeechError>())
        .any(crate::SpeechError::is_credit_error)
        || looks_like_credit_error(&format!("{error:#}"))
}

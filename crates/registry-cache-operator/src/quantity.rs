//! Storage quantity validation
//!
//! `k8s_openapi` carries quantities as opaque strings, so an invalid size would
//! only surface when the API server rejects the StatefulSet. Sizes are checked
//! here before anything is built.

use std::sync::LazyLock;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use regex::Regex;
use thiserror::Error;

static QUANTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]+)(?:\.([0-9]+))?(Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$").expect("valid regex")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("invalid size {0:?}, expected a number with an optional suffix such as Mi or Gi")]
    Invalid(String),
    #[error("size {0:?} must be greater than zero")]
    Zero(String),
}

/// Parse a storage size such as `10Gi` or `500M`.
pub fn parse_storage_quantity(raw: &str) -> Result<Quantity, QuantityError> {
    let trimmed = raw.trim();
    let caps = QUANTITY_REGEX
        .captures(trimmed)
        .ok_or_else(|| QuantityError::Invalid(raw.to_string()))?;

    let integer_zero = caps
        .get(1)
        .map(|m| m.as_str().bytes().all(|b| b == b'0'))
        .unwrap_or(true);
    let fraction_zero = caps
        .get(2)
        .map(|m| m.as_str().bytes().all(|b| b == b'0'))
        .unwrap_or(true);

    if integer_zero && fraction_zero {
        return Err(QuantityError::Zero(raw.to_string()));
    }

    Ok(Quantity(trimmed.to_string()))
}

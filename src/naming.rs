//! Endpoint name validation.
//!
//! Endpoint names become workload names and label values, so they must obey
//! the DNS-label grammar the orchestrator enforces.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

/// Maximum length of an endpoint name (DNS label limit).
pub const MAX_ENDPOINT_NAME_LEN: usize = 63;

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static regex"));

/// Normalize and validate an endpoint name.
///
/// Input is trimmed and lowercased, then checked against
/// `^[a-z0-9]([-a-z0-9]*[a-z0-9])?$` with a 63-character limit. The
/// normalized name is returned on success.
pub fn validate_endpoint_name(raw: &str) -> Result<String> {
    let name = raw.trim().to_lowercase();

    if name.is_empty() {
        return Err(Error::InvalidInput("endpoint name is empty".to_string()));
    }
    if name.len() > MAX_ENDPOINT_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "endpoint name {name:?} exceeds {MAX_ENDPOINT_NAME_LEN} characters"
        )));
    }
    if !DNS_LABEL.is_match(&name) {
        return Err(Error::InvalidInput(format!(
            "endpoint name {name:?} must match ^[a-z0-9]([-a-z0-9]*[a-z0-9])?$"
        )));
    }

    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dns_labels() {
        for name in ["img", "a", "my-endpoint", "img2", "0abc", "a-b-c"] {
            assert!(validate_endpoint_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(validate_endpoint_name("  IMG  ").unwrap(), "img");
        assert_eq!(validate_endpoint_name("My-App").unwrap(), "my-app");
    }

    #[test]
    fn rejects_invalid_names() {
        for name in ["", "   ", "-img", "img-", "im_g", "im.g", "a b"] {
            assert!(validate_endpoint_name(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn rejects_overlong_names() {
        let name = "a".repeat(MAX_ENDPOINT_NAME_LEN);
        assert!(validate_endpoint_name(&name).is_ok());

        let name = "a".repeat(MAX_ENDPOINT_NAME_LEN + 1);
        assert!(matches!(
            validate_endpoint_name(&name),
            Err(Error::InvalidInput(_))
        ));
    }

    // The success set is exactly the DNS-label grammar: anything the regex
    // accepts validates, anything it rejects fails.
    #[test]
    fn validation_matches_the_grammar() {
        for raw in ["web-1", "x", "99", "a--b"] {
            assert_eq!(
                validate_endpoint_name(raw).is_ok(),
                DNS_LABEL.is_match(raw),
                "{raw}"
            );
        }
    }
}

//! Phone number normalization (NANP only)

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static NON_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\D").expect("Invalid digit regex"));

/// Canonicalize a phone number to `+1XXXXXXXXXX`
///
/// Strips every non-digit, drops a leading `1` from 11-digit input, and
/// requires exactly 10 digits to remain.
pub fn format_phone(raw: &str) -> Result<String> {
    let mut digits = NON_DIGIT.replace_all(raw, "").into_owned();

    if digits.len() == 11 && digits.starts_with('1') {
        digits.remove(0);
    }

    if digits.len() != 10 {
        return Err(Error::InvalidPhone(format!(
            "{raw:?}: expected 10 digits, got {}",
            digits.len()
        )));
    }

    Ok(format!("+1{}", digits))
}

/// Check whether a phone number can be canonicalized
pub fn is_valid_phone(raw: &str) -> bool {
    format_phone(raw).is_ok()
}

/// Canonicalize if possible, otherwise keep the raw value trimmed
///
/// Used for vendor-supplied sender ids, which are not always phone numbers.
pub fn canonical_or_raw(raw: &str) -> String {
    format_phone(raw).unwrap_or_else(|_| raw.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_format_phone_e164() {
        assert_eq!(format_phone("+16175551234").unwrap(), "+16175551234");
    }

    #[test]
    fn test_format_phone_with_punctuation() {
        assert_eq!(format_phone("(617) 555-1234").unwrap(), "+16175551234");
        assert_eq!(format_phone("617.555.1234").unwrap(), "+16175551234");
        assert_eq!(format_phone("+1 617 555 1234").unwrap(), "+16175551234");
    }

    #[test]
    fn test_format_phone_11_digit() {
        assert_eq!(format_phone("16175551234").unwrap(), "+16175551234");
    }

    #[test]
    fn test_format_phone_rejects_wrong_length() {
        assert!(matches!(format_phone("555-1234"), Err(Error::InvalidPhone(_))));
        assert!(format_phone("").is_err());
        // 11 digits not starting with 1
        assert!(format_phone("26175551234").is_err());
        // International
        assert!(format_phone("+447911123456").is_err());
    }

    #[test]
    fn test_is_valid_phone() {
        assert!(is_valid_phone("617-555-1234"));
        assert!(!is_valid_phone("hello"));
    }

    #[test]
    fn test_canonical_or_raw() {
        assert_eq!(canonical_or_raw("6175551234"), "+16175551234");
        assert_eq!(canonical_or_raw(" shortcode "), "shortcode");
    }

    proptest! {
        #[test]
        fn format_phone_is_idempotent(digits in "[2-9][0-9]{9}", prefix in prop::bool::ANY, sep in "[ .()-]{0,2}") {
            let raw = if prefix {
                format!("1{sep}{digits}")
            } else {
                format!("{sep}{digits}")
            };
            let once = format_phone(&raw).unwrap();
            let twice = format_phone(&once).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn format_phone_rejects_short_input(digits in "[0-9]{0,9}") {
            prop_assert!(format_phone(&digits).is_err());
        }
    }
}

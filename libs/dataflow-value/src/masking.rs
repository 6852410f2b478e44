//! Sensitive-value masking applied before any log emission.

use crate::Value;
use std::fmt;

/// Field-name fragments that mark a value as sensitive. Matching is
/// case-insensitive and substring-based, so `user_password_hash` and
/// `ApiKey` both redact.
const SENSITIVE_MARKERS: &[&str] = &[
    "password",
    "secret",
    "token",
    "key",
    "credential",
    "authorization",
    "api_key",
    "private_key",
    "passphrase",
];

pub fn is_sensitive_field(field_name: &str) -> bool {
    let lowered = field_name.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// A display wrapper that redacts the value when the field name is
/// sensitive. This is what log statements format, never the raw value.
pub struct MaskedValue<'a> {
    field_name: &'a str,
    value: &'a Value,
}

pub fn mask_sensitive<'a>(field_name: &'a str, value: &'a Value) -> MaskedValue<'a> {
    MaskedValue { field_name, value }
}

impl fmt::Display for MaskedValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if is_sensitive_field(self.field_name) {
            f.write_str("<redacted>")
        } else {
            write!(f, "{}", self.value)
        }
    }
}

impl fmt::Debug for MaskedValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Masks a whole positional parameter list for logging. Without field names
/// to correlate against, parameters are printed as-is except `Bytes` and
/// anything longer than 64 characters, which are elided.
pub struct MaskedParams<'a>(pub &'a [Value]);

impl fmt::Display for MaskedParams<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let rendered = value.to_string();
            if rendered.chars().count() > 64 {
                let head: String = rendered.chars().take(64).collect();
                write!(f, "{head}…")?;
            } else {
                f.write_str(&rendered)?;
            }
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_matching_is_case_insensitive_substring() {
        assert!(is_sensitive_field("password"));
        assert!(is_sensitive_field("user_PASSWORD_hash"));
        assert!(is_sensitive_field("ApiKey"));
        assert!(is_sensitive_field("private_key"));
        assert!(!is_sensitive_field("email"));
        assert!(!is_sensitive_field("display_name"));
    }

    #[test]
    fn masked_display_redacts_only_sensitive_fields() {
        let v = Value::text("hunter2");
        assert_eq!(mask_sensitive("password", &v).to_string(), "<redacted>");
        assert_eq!(mask_sensitive("email", &v).to_string(), "\"hunter2\"");
    }
}

//! Phone-number normalization for the messaging channel.
//!
//! The stored contact address is never rewritten; normalization is applied
//! fresh on every delivery attempt and when comparing contact identities.

/// Normalize a raw phone number to international digits without `+`.
///
/// Steps, in order:
/// 1. trim surrounding whitespace
/// 2. strip one leading `+`
/// 3. strip one leading `0` (national trunk prefix)
/// 4. prepend `country_code` unless the digits already start with it
///
/// This is string surgery tuned to numbering plans where the trunk prefix is
/// a single `0`; it does not validate the number.
pub fn normalize_address(raw: &str, country_code: &str) -> String {
    let mut number = raw.trim();

    if let Some(rest) = number.strip_prefix('+') {
        number = rest;
    }

    if let Some(rest) = number.strip_prefix('0') {
        number = rest;
    }

    if number.starts_with(country_code) {
        number.to_string()
    } else {
        format!("{}{}", country_code, number)
    }
}

/// Build the channel chat id for an already-normalized number.
pub fn chat_id(normalized: &str, suffix: &str) -> String {
    format!("{}{}", normalized, suffix)
}

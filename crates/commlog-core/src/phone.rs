//! Phone number normalization and comparison.
//!
//! Remote addresses arrive in whatever shape the transport produced them:
//! `+44 (20) 7946-0018`, `020 7946 0018`, `sip:alice@example.org`. Phone
//! numbers are compared by their last [`PHONE_MATCH_LENGTH`] digits so
//! international and national forms of the same number match; everything
//! else is compared exactly.

/// Number of trailing digits used when comparing phone numbers.
pub const PHONE_MATCH_LENGTH: usize = 7;

/// Characters dropped from a number before it is inspected.
const SEPARATORS: &[char] = &[' ', '-', '.', '(', ')', '/', '\t'];

/// Characters that start a DTMF / pause suffix; everything after is dropped.
const DTMF_MARKERS: &[char] = &['p', 'P', 'w', 'W', 'x', 'X', ',', ';'];

/// Normalize a phone number.
///
/// Strips visual separators, keeps one leading `+`, cuts at the first
/// DTMF marker. Returns `None` if what remains is not a phone number
/// (empty, or containing anything other than digits).
pub fn normalize_phone_number(number: &str) -> Option<String> {
    let trimmed = number.trim();
    let body = match trimmed.find(DTMF_MARKERS) {
        Some(pos) => &trimmed[..pos],
        None => trimmed,
    };

    let mut normalized = String::with_capacity(body.len());
    for (i, c) in body.chars().filter(|c| !SEPARATORS.contains(c)).enumerate() {
        match c {
            '+' if i == 0 => normalized.push(c),
            '0'..='9' => normalized.push(c),
            _ => return None,
        }
    }

    let digits = normalized.trim_start_matches('+');
    if digits.is_empty() {
        return None;
    }
    Some(normalized)
}

/// Reduce a phone number to its comparison suffix.
///
/// Returns `None` for non-phone addresses.
pub fn minimize_phone_number(number: &str) -> Option<String> {
    let normalized = normalize_phone_number(number)?;
    let digits = normalized.trim_start_matches('+');
    let start = digits.len().saturating_sub(PHONE_MATCH_LENGTH);
    Some(digits[start..].to_string())
}

/// Whether `address` looks like a phone number.
pub fn is_phone_number(address: &str) -> bool {
    normalize_phone_number(address).is_some()
}

/// Compare two remote addresses, phone-number aware.
///
/// Phone numbers match on their minimized suffix; any other address (or a
/// phone number compared against a non-phone address) must be equal.
pub fn remote_addresses_match(a: &str, b: &str) -> bool {
    match (minimize_phone_number(a), minimize_phone_number(b)) {
        (Some(ma), Some(mb)) => ma == mb,
        _ => a == b,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

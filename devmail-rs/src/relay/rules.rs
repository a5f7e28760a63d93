//! Recipient allow/deny filtering
//!
//! Patterns support a single `*` as prefix or suffix wildcard (or anywhere,
//! splitting the pattern into a prefix and a suffix). Matching is
//! case-insensitive. Patterns with more than one `*`, and empty patterns,
//! never match.

/// Check whether `address` matches a rule pattern
pub fn matches_rule(address: &str, rule: &str) -> bool {
    if rule.is_empty() {
        return false;
    }

    let pattern = rule.to_lowercase();
    let addr = address.to_lowercase();

    if pattern == addr {
        return true;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    match parts.as_slice() {
        [prefix, suffix] => addr.starts_with(prefix) && addr.ends_with(suffix),
        _ => false,
    }
}

/// Keep recipients that pass the rules, preserving order
///
/// An allow match always keeps the address; otherwise a deny match drops
/// it; otherwise it is kept only when there are no allow rules at all.
pub fn filter_recipients(recipients: &[String], allow: &[String], deny: &[String]) -> Vec<String> {
    recipients
        .iter()
        .filter(|recipient| {
            if allow.iter().any(|rule| matches_rule(recipient, rule)) {
                return true;
            }
            if deny.iter().any(|rule| matches_rule(recipient, rule)) {
                return false;
            }
            allow.is_empty()
        })
        .cloned()
        .collect()
}

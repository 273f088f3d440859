//! Shared-store key namespaces.
//!
//! Every record the engine writes lives under one of these prefixes:
//!
//! - `DATA::<key>`: the entry's value blob, TTL = data TTL
//! - `INFO::<key>`: the entry's metadata hash, long retention
//! - `EXP::<key>`: existence-only marker whose native expiry event drives
//!   proactive refresh
//! - `NO-EXP::<key>`: short-lived suppression marker installed by explicit
//!   deletes to mask a racing expiry event
//! - `DEP::<dependency-key>`: set of cache keys depending on an upstream
//!   entity
//! - `THROTTLE::<bucket-key>`: sliding-window counters

pub const SEPARATOR: &str = "::";

pub const DATA: &str = "DATA";
pub const INFO: &str = "INFO";
pub const EXP: &str = "EXP";
pub const DEP: &str = "DEP";
pub const THROTTLE: &str = "THROTTLE";

/// Prefix of the suppression marker paired with an `EXP::` record.
pub const NO_EXP: &str = "NO-EXP";

pub fn data_key(key: &str) -> String {
    format!("{DATA}{SEPARATOR}{key}")
}

pub fn info_key(key: &str) -> String {
    format!("{INFO}{SEPARATOR}{key}")
}

pub fn exp_key(key: &str) -> String {
    format!("{EXP}{SEPARATOR}{key}")
}

pub fn suppress_key(key: &str) -> String {
    format!("{NO_EXP}{SEPARATOR}{key}")
}

pub fn dep_key(dependency_key: &str) -> String {
    format!("{DEP}{SEPARATOR}{dependency_key}")
}

pub fn throttle_key(bucket_key: &str) -> String {
    format!("{THROTTLE}{SEPARATOR}{bucket_key}")
}

/// The `EXP::` namespace prefix used for expiry watching.
pub fn exp_prefix() -> String {
    format!("{EXP}{SEPARATOR}")
}

/// Split a raw store key into (namespace, cache key).
pub fn split(raw: &str) -> Option<(&str, &str)> {
    raw.split_once(SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespacing_roundtrips() {
        assert_eq!(data_key("abc"), "DATA::abc");
        assert_eq!(split(&exp_key("abc")), Some((EXP, "abc")));
        assert_eq!(split("no-namespace"), None);
    }

    #[test]
    fn suppress_key_pairs_with_exp_key() {
        assert_eq!(suppress_key("abc"), "NO-EXP::abc");
        assert_eq!(split(&suppress_key("abc")), Some((NO_EXP, "abc")));
    }
}

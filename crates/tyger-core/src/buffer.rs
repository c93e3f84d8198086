//! Buffer id/tag validation and etag computation.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{Result, TygerError};
use crate::types::MAX_BUFFER_TAGS;

static TAG_KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9\-_.]{1,128}$").unwrap());
static TAG_VALUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9\-_.]{0,256}$").unwrap());

/// Buffer ids are 128 bits of randomness, lower-case base32, no padding —
/// URL-safe and case-insensitive-filesystem-safe for the data plane's
/// on-disk layout.
pub fn generate_buffer_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    data_encoding::BASE32_NOPAD.encode(&bytes).to_lowercase()
}

pub fn validate_tags(tags: &HashMap<String, String>) -> Result<()> {
    if tags.len() > MAX_BUFFER_TAGS {
        return Err(TygerError::validation(
            "TooManyTags",
            format!("at most {MAX_BUFFER_TAGS} tags are allowed, got {}", tags.len()),
        ));
    }
    for (key, value) in tags {
        if !TAG_KEY_RE.is_match(key) {
            return Err(TygerError::validation(
                "InvalidTag",
                format!("tag key '{key}' must match ^[A-Za-z0-9\\-_.]{{1,128}}$"),
            ));
        }
        if !TAG_VALUE_RE.is_match(value) {
            return Err(TygerError::validation(
                "InvalidTag",
                format!("tag value for key '{key}' must match ^[A-Za-z0-9\\-_.]{{0,256}}$"),
            ));
        }
    }
    Ok(())
}

/// Deterministic 64-bit etag over `(id, isSoftDeleted, expiresAt, tags)`
/// per spec.md §3. Rendered as decimal, not hex, per the same section.
pub fn compute_etag(
    id: &str,
    tags: &HashMap<String, String>,
    is_soft_deleted: bool,
    expires_at_nanos: Option<i64>,
) -> String {
    let mut keys: Vec<&String> = tags.keys().collect();
    keys.sort();
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update([0u8]);
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(tags[key].as_bytes());
        hasher.update([0u8]);
    }
    hasher.update([is_soft_deleted as u8]);
    if let Some(nanos) = expires_at_nanos {
        hasher.update(nanos.to_le_bytes());
    }
    let digest = hasher.finalize();
    let bytes: [u8; 8] = digest[..8].try_into().expect("sha256 digest is at least 8 bytes");
    u64::from_be_bytes(bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_lowercase_base32_and_unique() {
        let a = generate_buffer_id();
        let b = generate_buffer_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn tag_validation_rejects_bad_key_and_long_value() {
        let mut tags = HashMap::new();
        tags.insert("bad key!".into(), "ok".into());
        assert!(validate_tags(&tags).is_err());

        let mut tags2 = HashMap::new();
        tags2.insert("ok".into(), "x".repeat(300));
        assert!(validate_tags(&tags2).is_err());
    }

    #[test]
    fn tag_validation_rejects_too_many_tags() {
        let tags: HashMap<String, String> = (0..101).map(|i| (format!("k{i}"), "v".into())).collect();
        assert!(validate_tags(&tags).is_err());
    }

    #[test]
    fn etag_changes_when_tags_change() {
        let mut tags = HashMap::new();
        tags.insert("a".into(), "1".into());
        let e1 = compute_etag("buf1", &tags, false, None);
        tags.insert("a".into(), "2".into());
        let e2 = compute_etag("buf1", &tags, false, None);
        assert_ne!(e1, e2);
    }

    #[test]
    fn etag_changes_when_id_changes() {
        let tags = HashMap::new();
        let e1 = compute_etag("buf1", &tags, false, None);
        let e2 = compute_etag("buf2", &tags, false, None);
        assert_ne!(e1, e2);
    }

    #[test]
    fn etag_is_rendered_as_decimal() {
        let tags = HashMap::new();
        let etag = compute_etag("buf1", &tags, false, None);
        assert!(etag.chars().all(|c| c.is_ascii_digit()), "etag {etag} must be decimal");
    }

    #[test]
    fn etag_is_stable_regardless_of_map_iteration_order() {
        let mut t1 = HashMap::new();
        t1.insert("a".into(), "1".into());
        t1.insert("b".into(), "2".into());
        let mut t2 = HashMap::new();
        t2.insert("b".into(), "2".into());
        t2.insert("a".into(), "1".into());
        assert_eq!(compute_etag("buf1", &t1, false, None), compute_etag("buf1", &t2, false, None));
    }
}

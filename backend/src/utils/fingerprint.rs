use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hashes a canonical JSON value into a stable hex fingerprint.
///
/// `serde_json` maps are B-tree backed, so serialization is key-sorted and two
/// structurally equal values always produce the same digest.
pub fn canonical_fingerprint(value: &Value) -> String {
    let canonical = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_values_share_a_fingerprint() {
        let a = json!({"subject": "alice", "resource": "doc1", "action": "read"});
        let b = json!({"action": "read", "resource": "doc1", "subject": "alice"});
        assert_eq!(canonical_fingerprint(&a), canonical_fingerprint(&b));
    }

    #[test]
    fn different_values_diverge() {
        let a = json!({"subject": "alice", "action": "read"});
        let b = json!({"subject": "alice", "action": "write"});
        assert_ne!(canonical_fingerprint(&a), canonical_fingerprint(&b));
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = canonical_fingerprint(&json!({"k": "v"}));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

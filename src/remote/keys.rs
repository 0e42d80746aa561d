//! Single-table key layout.
//!
//! | Entity | pk | sk |
//! |--------|----|----|
//! | cache entry | `CACHE#<hash>` | `DATA` |
//! | dedupe lock | `DEDUPE#<hash>` | `LOCK` |
//! | dedupe job | `DEDUPE#<hash>` | `JOB#<job id>` |
//! | rate-limit record | `RATELIMIT#<resource>` | `REQ#<13-digit ms>#<uuid>` |
//! | adaptive capacity | `ADAPTIVE#<resource>` | `META` |

use super::table::ItemKey;

pub const CACHE_PREFIX: &str = "CACHE#";
pub const DEDUPE_PREFIX: &str = "DEDUPE#";
pub const RATE_LIMIT_PREFIX: &str = "RATELIMIT#";
pub const ADAPTIVE_PREFIX: &str = "ADAPTIVE#";

pub const CACHE_SK: &str = "DATA";
pub const LOCK_SK: &str = "LOCK";
pub const JOB_SK_PREFIX: &str = "JOB#";
pub const REQUEST_SK_PREFIX: &str = "REQ#";
pub const META_SK: &str = "META";

pub mod attr {
    pub const ENTITY: &str = "entityType";
    pub const VALUE: &str = "value";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const EXPIRES_AT: &str = "expiresAt";
    pub const JOB_ID: &str = "jobId";
    pub const STATUS: &str = "status";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const RESOURCE: &str = "resource";
    pub const TIMESTAMP: &str = "timestamp";
    pub const PRIORITY: &str = "priority";
    pub const CAPACITY: &str = "capacity";
}

/// `entityType` written under each partition prefix; the expiry index is keyed on it.
pub fn entity_for_prefix(prefix: &str) -> Option<&'static str> {
    match prefix {
        CACHE_PREFIX => Some("cache"),
        DEDUPE_PREFIX => Some("dedupe"),
        RATE_LIMIT_PREFIX => Some("ratelimit"),
        ADAPTIVE_PREFIX => Some("adaptive"),
        _ => None,
    }
}

pub fn cache(hash: &str) -> ItemKey {
    ItemKey::new(format!("{CACHE_PREFIX}{hash}"), CACHE_SK)
}

pub fn dedupe_lock(hash: &str) -> ItemKey {
    ItemKey::new(format!("{DEDUPE_PREFIX}{hash}"), LOCK_SK)
}

pub fn dedupe_job(hash: &str, job_id: &str) -> ItemKey {
    ItemKey::new(format!("{DEDUPE_PREFIX}{hash}"), format!("{JOB_SK_PREFIX}{job_id}"))
}

pub fn rate_limit_partition(resource: &str) -> String {
    format!("{RATE_LIMIT_PREFIX}{resource}")
}

/// Zero-padded so lexicographic order matches numeric order.
pub fn request_sort_key(at_ms: i64, id: &str) -> String {
    format!("{REQUEST_SK_PREFIX}{:013}#{id}", at_ms.max(0))
}

/// Smallest sort key strictly after every record at `at_ms`.
pub fn request_sort_key_after(at_ms: i64) -> String {
    // '$' sorts after '#', the separator in `request_sort_key`.
    format!("{REQUEST_SK_PREFIX}{:013}$", at_ms.max(0))
}

pub fn request_sort_key_upper() -> String {
    format!("{REQUEST_SK_PREFIX}~")
}

pub fn adaptive_meta(resource: &str) -> ItemKey {
    ItemKey::new(format!("{ADAPTIVE_PREFIX}{resource}"), META_SK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(cache("abc"), ItemKey::new("CACHE#abc", "DATA"));
        assert_eq!(dedupe_lock("abc").sk, "LOCK");
        assert_eq!(dedupe_job("abc", "j1").sk, "JOB#j1");
        assert_eq!(adaptive_meta("issues").pk, "ADAPTIVE#issues");
        assert_eq!(request_sort_key(42, "u"), "REQ#0000000000042#u");
        assert_eq!(entity_for_prefix(RATE_LIMIT_PREFIX), Some("ratelimit"));
        assert_eq!(entity_for_prefix("OTHER#"), None);
    }

    #[test]
    fn test_request_keys_sort_numerically() {
        let a = request_sort_key(999, "z");
        let b = request_sort_key(1000, "a");
        assert!(a < b);
        assert!(request_sort_key(1000, "ffff") < request_sort_key_after(1000));
        assert!(request_sort_key_after(1000) < request_sort_key(1001, "0"));
        assert!(request_sort_key(9_999_999_999_999, "f") < request_sort_key_upper());
    }
}

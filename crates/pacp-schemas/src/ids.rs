//! Prefixed, lexically-sortable opaque identifiers.
//!
//! IDs are `<prefix>_<26 lowercase-hex chars>`, where the hex body is the
//! big-endian bytes of a UUIDv7 (time-ordered, per RFC 9562). Because the
//! high bits of a v7 UUID are a millisecond timestamp, IDs generated later
//! sort lexically after IDs generated earlier — `created_at DESC` and
//! `id DESC` agree, which keeps pagination and free-text ID search honest.

use uuid::Uuid;

/// Generate a new prefixed id, e.g. `op_0190f3a2...`.
pub fn new_id(prefix: &str) -> String {
    let uuid = Uuid::now_v7();
    format!("{prefix}_{}", hex::encode(uuid.as_bytes()))
}

/// Hex-encoding without pulling in the `hex` crate for one call site.
mod hex {
    pub fn encode(bytes: [u8; 16]) -> String {
        let mut out = String::with_capacity(32);
        for b in bytes {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }
}

pub const OPERATION_PREFIX: &str = "op";
pub const SYNC_JOB_PREFIX: &str = "sj";
pub const UPSTREAM_INSTANCE_PREFIX: &str = "inst";
pub const CA_PREFIX: &str = "ca";
pub const SESSION_PREFIX: &str = "sess";
pub const MIRROR_USER_PREFIX: &str = "mu";
pub const MIRROR_MEMBERSHIP_PREFIX: &str = "mm";
pub const MIRROR_AUTH_PREFIX: &str = "ma";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_monotonic() {
        let a = new_id(OPERATION_PREFIX);
        let b = new_id(OPERATION_PREFIX);
        assert!(a.starts_with("op_"));
        assert!(b.starts_with("op_"));
        assert!(b > a, "later id must sort after earlier id: {a} vs {b}");
    }
}

//! Session Registry
//!
//! Deterministic mapping from logical keys (PR number, conversation id, ...)
//! to internal session identifiers.

use crate::error::{BackendError, BackendResult};
use uuid::Uuid;

/// Internal session identifier
pub type SessionId = Uuid;

/// Namespace every logical key is hashed into.
pub const SESSION_NAMESPACE: Uuid = Uuid::from_u128(0x6167_7365_7373_4f6e_9a1c_5e55_10f0_0d01);

/// Resolve a logical key to its session id.
///
/// The same key always yields the same id, across calls and processes. The
/// key is hashed byte for byte; only keys that are empty or consist solely of
/// whitespace are rejected.
pub fn resolve(logical_key: &str) -> BackendResult<SessionId> {
    resolve_in(&SESSION_NAMESPACE, logical_key)
}

/// Resolve a logical key inside a caller-provided namespace
pub fn resolve_in(namespace: &Uuid, logical_key: &str) -> BackendResult<SessionId> {
    if logical_key.trim().is_empty() {
        return Err(BackendError::InvalidKey(
            "logical key must not be empty".to_string(),
        ));
    }
    Ok(Uuid::new_v5(namespace, logical_key.as_bytes()))
}

/// Logical key for a pull request
#[must_use]
pub fn pr_key(owner: &str, repo: &str, number: u64) -> String {
    format!("pr:{owner}/{repo}/{number}")
}

/// Logical key for a conversation thread
#[must_use]
pub fn conversation_key(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_is_deterministic() {
        let a = resolve("pr:acme/widgets/42").unwrap();
        let b = resolve("pr:acme/widgets/42").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn test_distinct_keys_distinct_ids() {
        let a = resolve("pr:acme/widgets/42").unwrap();
        let b = resolve("pr:acme/widgets/43").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_matches_uuid_v5() {
        let id = resolve("conversation:abc").unwrap();
        assert_eq!(id, Uuid::new_v5(&SESSION_NAMESPACE, b"conversation:abc"));
    }

    #[test]
    fn test_empty_key_rejected() {
        for key in ["", "   ", "\t\n"] {
            let err = resolve(key).unwrap_err();
            assert!(matches!(err, BackendError::InvalidKey(_)));
            assert_eq!(err.category(), crate::error::ErrorCategory::Config);
        }
    }

    #[test]
    fn test_surrounding_whitespace_is_significant() {
        assert_ne!(resolve("key").unwrap(), resolve(" key").unwrap());
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let other = Uuid::from_u128(1);
        assert_ne!(
            resolve("same").unwrap(),
            resolve_in(&other, "same").unwrap()
        );
    }

    #[test]
    fn test_key_helpers() {
        assert_eq!(pr_key("acme", "widgets", 7), "pr:acme/widgets/7");
        assert_eq!(conversation_key("c-1"), "conversation:c-1");
    }
}

//! Composite namespace keys
//!
//! Encoding:
//!
//! ```text
//! +----------------------+
//! | Namespace Length     | (u16 BE)
//! +----------------------+
//! | Namespace            | (UTF-8 bytes)
//! +----------------------+
//! | Key                  | (raw bytes, to end)
//! +----------------------+
//! ```
//!
//! The length prefix makes every namespace's encoded prefix unique: no
//! namespace prefix can match keys of another namespace, whatever bytes the
//! namespace or key contain. Within a namespace, encoded keys sort exactly as
//! the raw keys do.

use std::fmt;

use super::errors::{StoreError, StoreResult};

const NAMESPACE_LEN_BYTES: usize = 2;

/// A key qualified by its namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NamespaceKey {
    /// Logical partition of the key space
    pub namespace: String,
    /// Key within the namespace
    pub key: Vec<u8>,
}

impl NamespaceKey {
    /// Create a new namespace key
    pub fn new(namespace: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Encode into the sortable composite byte representation.
    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        encode(&self.namespace, &self.key)
    }

    /// Decode a composite key produced by [`NamespaceKey::encode`].
    pub fn decode(composite: &[u8]) -> StoreResult<Self> {
        if composite.len() < NAMESPACE_LEN_BYTES {
            return Err(StoreError::invalid_key(format!(
                "composite key too short: {} bytes",
                composite.len()
            )));
        }
        let ns_len = u16::from_be_bytes([composite[0], composite[1]]) as usize;
        let ns_end = NAMESPACE_LEN_BYTES + ns_len;
        if ns_len == 0 || composite.len() < ns_end {
            return Err(StoreError::invalid_key(format!(
                "composite key declares namespace of {} bytes in {} byte key",
                ns_len,
                composite.len()
            )));
        }
        let namespace = std::str::from_utf8(&composite[NAMESPACE_LEN_BYTES..ns_end])
            .map_err(|e| StoreError::invalid_key(format!("namespace is not UTF-8: {}", e)))?;

        Ok(Self {
            namespace: namespace.to_string(),
            key: composite[ns_end..].to_vec(),
        })
    }

    /// The composite prefix shared by every key of `namespace`.
    pub fn namespace_prefix(namespace: &str) -> StoreResult<Vec<u8>> {
        encode(namespace, &[])
    }

    /// Key bytes as lossy UTF-8, for logs and CLI output.
    pub fn key_lossy(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

impl fmt::Display for NamespaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, String::from_utf8_lossy(&self.key))
    }
}

/// Encode `namespace` and `key` into a composite key.
pub fn encode(namespace: &str, key: &[u8]) -> StoreResult<Vec<u8>> {
    if namespace.is_empty() {
        return Err(StoreError::invalid_key("namespace must not be empty"));
    }
    if namespace.len() > u16::MAX as usize {
        return Err(StoreError::invalid_key(format!(
            "namespace is {} bytes, maximum is {}",
            namespace.len(),
            u16::MAX
        )));
    }

    let mut buf = Vec::with_capacity(NAMESPACE_LEN_BYTES + namespace.len() + key.len());
    buf.extend_from_slice(&(namespace.len() as u16).to_be_bytes());
    buf.extend_from_slice(namespace.as_bytes());
    buf.extend_from_slice(key);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let key = NamespaceKey::new("overemployed", "post_abc");
        let decoded = NamespaceKey::decode(&key.encode().unwrap()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_namespace_prefix_does_not_match_longer_namespace() {
        // With a plain "ns/" separator, "a" would be a prefix of "a/b"'s keys.
        let prefix = NamespaceKey::namespace_prefix("a").unwrap();
        let other = encode("a/b", b"key").unwrap();
        let own = encode("a", b"/b/key").unwrap();
        assert!(!other.starts_with(&prefix));
        assert!(own.starts_with(&prefix));
    }

    #[test]
    fn test_keys_sort_within_namespace() {
        let a = encode("posts", b"post_a").unwrap();
        let b = encode("posts", b"post_b").unwrap();
        let long = encode("posts", b"post_aa").unwrap();
        assert!(a < long);
        assert!(long < b);
    }

    #[test]
    fn test_empty_namespace_rejected() {
        assert!(encode("", b"k").is_err());
        assert!(NamespaceKey::decode(&[0, 0, b'k']).is_err());
    }

    #[test]
    fn test_truncated_composite_rejected() {
        assert!(NamespaceKey::decode(&[0]).is_err());
        assert!(NamespaceKey::decode(&[0, 9, b'a']).is_err());
    }

    #[test]
    fn test_display() {
        let key = NamespaceKey::new("index", "overemployed");
        assert_eq!(key.to_string(), "index/overemployed");
    }
}

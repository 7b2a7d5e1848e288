//! Content fingerprints used to detect idempotent schema registration

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA256 checksum of canonical JSON content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(String);

impl Checksum {
    /// Compute checksum from raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{:x}", hash))
    }

    /// Compute checksum of any serializable value
    ///
    /// Callers must hand in types with deterministic key order (the
    /// descriptor types use `BTreeMap`), otherwise equal content can hash
    /// differently.
    pub fn of<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        let canonical = serde_json::to_vec(value)?;
        Ok(Self::from_bytes(&canonical))
    }

    /// Get the hex string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_checksum_consistency() {
        let mut a = BTreeMap::new();
        a.insert("name", "test");
        a.insert("id", "1");
        let mut b = BTreeMap::new();
        b.insert("id", "1");
        b.insert("name", "test");
        assert_eq!(Checksum::of(&a).unwrap(), Checksum::of(&b).unwrap());
    }

    #[test]
    fn test_checksum_different_content() {
        let c1 = Checksum::from_bytes(br#"{"name":"test1"}"#);
        let c2 = Checksum::from_bytes(br#"{"name":"test2"}"#);
        assert_ne!(c1, c2);
        assert_eq!(c1.as_str().len(), 64);
    }
}

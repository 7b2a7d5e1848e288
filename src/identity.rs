//! Schema identity: the `(namespace, name, version)` key of a registry slot

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"))
}

/// Identity of a schema slot
///
/// Canonical form is `namespace.name.version`. Segments cannot contain dots,
/// so the canonical string always parses back into the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaIdentity {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl SchemaIdentity {
    /// Create an identity, validating every segment
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self> {
        let identity = Self {
            namespace: namespace.into(),
            name: name.into(),
            version: version.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    /// Parse the canonical `namespace.name.version` form
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            [namespace, name, version] => Self::new(*namespace, *name, *version),
            _ => Err(IngestError::InvalidIdentity(format!(
                "expected namespace.name.version, got '{}'",
                key
            ))),
        }
    }

    /// Check segment syntax (used after deserialization, which bypasses `new`)
    pub fn validate(&self) -> Result<()> {
        for (label, value) in [
            ("namespace", &self.namespace),
            ("name", &self.name),
            ("version", &self.version),
        ] {
            if !segment_pattern().is_match(value) {
                return Err(IngestError::InvalidIdentity(format!(
                    "{} '{}' must be non-empty and contain only letters, digits, '_' or '-'",
                    label, value
                )));
            }
        }
        Ok(())
    }

    /// The canonical registry key
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SchemaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.namespace, self.name, self.version)
    }
}

impl FromStr for SchemaIdentity {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

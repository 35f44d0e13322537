//! Journal names, specs, and access flags.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::codec::CompressionCodec;
use super::error::CoreError;

const MAX_JOURNAL_NAME_LEN: usize = 512;

/// A validated, path-like journal name.
///
/// Names are `/`-separated segments of `[a-zA-Z0-9_.%+-]`, with no leading,
/// trailing, or empty segment.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JournalName(String);

impl JournalName {
    pub fn parse(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        let invalid = |reason: &str| CoreError::InvalidJournalName {
            raw: raw.clone(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("empty"));
        }
        if raw.len() > MAX_JOURNAL_NAME_LEN {
            return Err(invalid("name too long"));
        }
        if raw.starts_with('/') {
            return Err(invalid("cannot begin with '/'"));
        }
        if raw.ends_with('/') {
            return Err(invalid("cannot end with '/'"));
        }
        for segment in raw.split('/') {
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }
            for c in segment.bytes() {
                if !(c.is_ascii_alphanumeric() || matches!(c, b'_' | b'.' | b'%' | b'+' | b'-')) {
                    return Err(invalid("disallowed character"));
                }
            }
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JournalName {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, CoreError> {
        Self::parse(raw)
    }
}

impl From<JournalName> for String {
    fn from(name: JournalName) -> String {
        name.0
    }
}

impl fmt::Debug for JournalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JournalName({:?})", self.0)
    }
}

impl fmt::Display for JournalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Journal access flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl AccessMode {
    pub fn may_read(self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    pub fn may_write(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// Target parameters for the fragments of a journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentParams {
    /// Roll the open fragment once it reaches this many bytes.
    pub max_length_bytes: u64,
    pub codec: CompressionCodec,
    /// How often each replica re-lists the backing stores.
    pub refresh_interval_ms: u64,
    /// Roll a non-empty open fragment older than this, so content reaches
    /// the store without waiting for max_length_bytes. Zero disables.
    pub flush_age_ms: u64,
    /// Backing store roots, in persistence preference order. Empty means
    /// the journal is never offloaded.
    pub stores: Vec<String>,
}

impl Default for FragmentParams {
    fn default() -> Self {
        Self {
            max_length_bytes: 512 * 1024 * 1024,
            codec: CompressionCodec::None,
            refresh_interval_ms: 60_000,
            flush_age_ms: 0,
            stores: Vec::new(),
        }
    }
}

/// The desired state of a journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalSpec {
    pub name: JournalName,
    #[serde(default = "default_replication")]
    pub replication: u32,
    #[serde(default)]
    pub access: AccessMode,
    #[serde(default)]
    pub fragment: FragmentParams,
}

fn default_replication() -> u32 {
    1
}

impl JournalSpec {
    pub fn new(name: JournalName) -> Self {
        Self {
            name,
            replication: 1,
            access: AccessMode::default(),
            fragment: FragmentParams::default(),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |reason: &str| CoreError::InvalidSpec {
            journal: self.name.as_str().to_string(),
            reason: reason.to_string(),
        };
        if self.replication == 0 {
            return Err(invalid("replication must be at least 1"));
        }
        if self.fragment.max_length_bytes == 0 {
            return Err(invalid("fragment.max_length_bytes must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(JournalName::parse("a/journal").is_ok());
        assert!(JournalName::parse("topic/part-001").is_ok());
        assert!(JournalName::parse("a.b/c%2Fd+e_f").is_ok());

        assert!(JournalName::parse("").is_err());
        assert!(JournalName::parse("/invalid/journal").is_err());
        assert!(JournalName::parse("trailing/").is_err());
        assert!(JournalName::parse("double//segment").is_err());
        assert!(JournalName::parse("with space").is_err());
        assert!(JournalName::parse("x".repeat(513)).is_err());
    }

    #[test]
    fn access_flags() {
        assert!(AccessMode::ReadWrite.may_read());
        assert!(AccessMode::ReadWrite.may_write());
        assert!(!AccessMode::ReadOnly.may_write());
        assert!(!AccessMode::WriteOnly.may_read());
    }

    #[test]
    fn spec_validation() {
        let mut spec = JournalSpec::new(JournalName::parse("a/journal").unwrap());
        assert!(spec.validate().is_ok());

        spec.replication = 0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn spec_json_roundtrip() {
        let spec = JournalSpec::new(JournalName::parse("a/journal").unwrap());
        let json = serde_json::to_string(&spec).unwrap();
        let decoded: JournalSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, decoded);
    }
}

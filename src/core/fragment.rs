//! The content-addressed fragment descriptor.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::codec::CompressionCodec;
use super::error::CoreError;
use super::journal::JournalName;
use super::sum::Sha1Sum;

/// An immutable byte range `[begin, end)` of a journal.
///
/// The sum covers the decompressed content. Once a fragment reaches a
/// backing store it never changes; divergent fragments with equal extents
/// coexist under distinct content names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub journal: JournalName,
    pub begin: u64,
    pub end: u64,
    pub sum: Sha1Sum,
    pub codec: CompressionCodec,
    /// Root of the store holding this fragment's content, if persisted.
    pub backing_store: Option<String>,
    pub mod_time_ms: u64,
}

impl Fragment {
    /// An empty fragment opening at `offset`.
    pub fn empty(journal: JournalName, offset: u64, codec: CompressionCodec) -> Self {
        Self {
            journal,
            begin: offset,
            end: offset,
            sum: Sha1Sum::ZERO,
            codec,
            backing_store: None,
            mod_time_ms: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Whether `other` names the same content extent. Ignores backing store
    /// and mod-time, which vary by replica.
    pub fn equivalent(&self, other: &Fragment) -> bool {
        self.journal == other.journal
            && self.begin == other.begin
            && self.end == other.end
            && self.sum == other.sum
            && self.codec == other.codec
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.begin > self.end {
            return Err(CoreError::InvalidFragment {
                reason: format!("begin {} exceeds end {}", self.begin, self.end),
            });
        }
        if self.is_empty() != self.sum.is_zero() {
            return Err(CoreError::InvalidFragment {
                reason: "zero-length fragments carry the zero sum, and only they do".to_string(),
            });
        }
        Ok(())
    }

    /// The content-addressed file name of this fragment within its journal
    /// directory: `{begin:016x}-{end:016x}-{sum}{ext}`.
    pub fn content_name(&self) -> String {
        format!(
            "{:016x}-{:016x}-{}{}",
            self.begin,
            self.end,
            self.sum.to_hex(),
            self.codec.ext()
        )
    }

    /// The store-relative content path: `{journal}/{content_name}`.
    pub fn content_path(&self) -> String {
        format!("{}/{}", self.journal, self.content_name())
    }

    /// Recover a fragment from a listed content name.
    pub fn parse_content_name(journal: &JournalName, name: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidFragment {
            reason: format!("content name {name:?}: {reason}"),
        };

        let (stem, codec) = CompressionCodec::split_ext(name);
        let mut parts = stem.splitn(3, '-');
        let (begin, end, sum_hex) = match (parts.next(), parts.next(), parts.next()) {
            (Some(b), Some(e), Some(s)) => (b, e, s),
            _ => return Err(invalid("expected begin-end-sum")),
        };
        let begin = u64::from_str_radix(begin, 16).map_err(|_| invalid("bad begin offset"))?;
        let end = u64::from_str_radix(end, 16).map_err(|_| invalid("bad end offset"))?;
        let sum = Sha1Sum::parse_hex(sum_hex)?;

        let fragment = Self {
            journal: journal.clone(),
            begin,
            end,
            sum,
            codec,
            backing_store: None,
            mod_time_ms: 0,
        };
        fragment.validate()?;
        Ok(fragment)
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}, {})", self.journal, self.begin, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal() -> JournalName {
        JournalName::parse("a/journal").unwrap()
    }

    #[test]
    fn content_name_roundtrip() {
        let fragment = Fragment {
            journal: journal(),
            begin: 0x20,
            end: 0x120,
            sum: Sha1Sum::of(b"content"),
            codec: CompressionCodec::Gzip,
            backing_store: None,
            mod_time_ms: 0,
        };
        let name = fragment.content_name();
        assert!(name.ends_with(".gz"));

        let parsed = Fragment::parse_content_name(&journal(), &name).unwrap();
        assert!(parsed.equivalent(&fragment));
        assert_eq!(
            fragment.content_path(),
            format!("a/journal/{}", fragment.content_name())
        );
    }

    #[test]
    fn empty_fragment() {
        let fragment = Fragment::empty(journal(), 64, CompressionCodec::None);
        assert!(fragment.is_empty());
        assert_eq!(fragment.len(), 0);
        assert!(fragment.validate().is_ok());
    }

    #[test]
    fn validation_rejects_inverted_extent() {
        let mut fragment = Fragment::empty(journal(), 64, CompressionCodec::None);
        fragment.end = 32;
        assert!(fragment.validate().is_err());
    }

    #[test]
    fn validation_ties_sum_to_extent() {
        let mut fragment = Fragment::empty(journal(), 0, CompressionCodec::None);
        fragment.sum = Sha1Sum::of(b"phantom");
        assert!(fragment.validate().is_err());

        fragment.end = 7;
        assert!(fragment.validate().is_ok());
    }

    #[test]
    fn equivalence_ignores_placement() {
        let mut a = Fragment::empty(journal(), 0, CompressionCodec::None);
        a.end = 9;
        a.sum = Sha1Sum::of(b"foobarbaz");
        let mut b = a.clone();
        b.backing_store = Some("file:///tmp/store".to_string());
        b.mod_time_ms = 12345;
        assert!(a.equivalent(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn parse_rejects_malformed_names() {
        assert!(Fragment::parse_content_name(&journal(), "junk").is_err());
        assert!(Fragment::parse_content_name(&journal(), "00-zz-abc").is_err());
        // Inverted extent.
        let name = format!(
            "{:016x}-{:016x}-{}",
            9,
            0,
            Sha1Sum::of(b"foobarbaz").to_hex()
        );
        assert!(Fragment::parse_content_name(&journal(), &name).is_err());
    }
}

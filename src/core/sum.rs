//! SHA-1 content sums and running summers.
//!
//! Fragments are content-addressed by the SHA-1 of their decompressed bytes.
//! A zero-length extent has the zero sum, not the digest of the empty string,
//! so empty fragments compare equal regardless of hasher state.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use super::error::CoreError;

pub const SUM_LEN: usize = 20;

/// A SHA-1 digest of fragment content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha1Sum(pub [u8; SUM_LEN]);

impl Sha1Sum {
    pub const ZERO: Sha1Sum = Sha1Sum([0u8; SUM_LEN]);

    /// Sum of a complete byte slice. Empty input yields the zero sum.
    pub fn of(content: &[u8]) -> Self {
        if content.is_empty() {
            return Self::ZERO;
        }
        let digest = Sha1::digest(content);
        let mut out = [0u8; SUM_LEN];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; SUM_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(SUM_LEN * 2);
        for b in &self.0 {
            s.push(char::from_digit((b >> 4) as u32, 16).unwrap_or('0'));
            s.push(char::from_digit((b & 0xf) as u32, 16).unwrap_or('0'));
        }
        s
    }

    pub fn parse_hex(raw: &str) -> Result<Self, CoreError> {
        if raw.len() != SUM_LEN * 2 {
            return Err(CoreError::InvalidSum {
                raw: raw.to_string(),
                reason: format!("expected {} hex characters", SUM_LEN * 2),
            });
        }
        let mut out = [0u8; SUM_LEN];
        for (i, chunk) in raw.as_bytes().chunks(2).enumerate() {
            let hi = hex_val(chunk[0]);
            let lo = hex_val(chunk[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => out[i] = (hi << 4) | lo,
                _ => {
                    return Err(CoreError::InvalidSum {
                        raw: raw.to_string(),
                        reason: "non-hex character".to_string(),
                    });
                }
            }
        }
        Ok(Self(out))
    }
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl fmt::Debug for Sha1Sum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Sum({})", self.to_hex())
    }
}

impl fmt::Display for Sha1Sum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A running SHA-1 over streamed content.
///
/// `Clone` lets the spool snapshot the hash state at each commit boundary;
/// rollback restores the snapshot instead of rehashing committed content.
#[derive(Clone)]
pub struct Summer {
    digest: Sha1,
    len: u64,
}

impl Summer {
    pub fn new() -> Self {
        Self {
            digest: Sha1::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, content: &[u8]) {
        self.digest.update(content);
        self.len += content.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The sum of all content written so far. Does not consume the summer.
    pub fn sum(&self) -> Sha1Sum {
        if self.len == 0 {
            return Sha1Sum::ZERO;
        }
        let digest = self.digest.clone().finalize();
        let mut out = [0u8; SUM_LEN];
        out.copy_from_slice(&digest);
        Sha1Sum(out)
    }
}

impl Default for Summer {
    fn default() -> Self {
        Self::new()
    }
}

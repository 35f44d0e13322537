//! Process identities and journal routes.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::CoreError;

/// A broker process identity: `zone#suffix`.
///
/// The zone groups failure domains; the suffix names the process within it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProcessId {
    zone: String,
    suffix: String,
}

impl ProcessId {
    pub fn new(zone: impl Into<String>, suffix: impl Into<String>) -> Result<Self, CoreError> {
        let zone = zone.into();
        let suffix = suffix.into();
        validate_token(&zone, "zone")?;
        validate_token(&suffix, "suffix")?;
        Ok(Self { zone, suffix })
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let Some((zone, suffix)) = raw.split_once('#') else {
            return Err(CoreError::InvalidProcessId {
                raw: raw.to_string(),
                reason: "missing '#' separator".to_string(),
            });
        };
        Self::new(zone, suffix)
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

fn validate_token(token: &str, field: &str) -> Result<(), CoreError> {
    if token.is_empty() {
        return Err(CoreError::InvalidProcessId {
            raw: token.to_string(),
            reason: format!("empty {field}"),
        });
    }
    for c in token.bytes() {
        if !(c.is_ascii_alphanumeric() || matches!(c, b'_' | b'.' | b'-')) {
            return Err(CoreError::InvalidProcessId {
                raw: token.to_string(),
                reason: format!("disallowed character in {field}"),
            });
        }
    }
    Ok(())
}

impl TryFrom<String> for ProcessId {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, CoreError> {
        Self::parse(&raw)
    }
}

impl From<ProcessId> for String {
    fn from(id: ProcessId) -> String {
        format!("{}#{}", id.zone, id.suffix)
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessId({}#{})", self.zone, self.suffix)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.zone, self.suffix)
    }
}

/// An ordered member list for a journal, with a designated primary.
///
/// Routes are immutable snapshots derived from coordination-store
/// assignments; they are compared, never mutated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub members: Vec<ProcessId>,
    pub primary: Option<usize>,
}

impl Route {
    pub fn primary_id(&self) -> Option<&ProcessId> {
        self.primary.and_then(|i| self.members.get(i))
    }

    pub fn contains(&self, id: &ProcessId) -> bool {
        self.members.iter().any(|m| m == id)
    }

    /// Whether two routes name the same members with the same primary.
    pub fn equivalent(&self, other: &Route) -> bool {
        self.members == other.members && self.primary_id() == other.primary_id()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, m) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if Some(i) == self.primary {
                write!(f, "*{m}")?;
            } else {
                write!(f, "{m}")?;
            }
        }
        write!(f, "]")
    }
}

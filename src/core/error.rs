//! Core validation errors (parsing, naming, spec invariants).
//!
//! These are bounded and stable: core errors represent domain/refusal
//! states, not library implementation details.

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    #[error("invalid journal name {raw:?}: {reason}")]
    InvalidJournalName { raw: String, reason: String },

    #[error("invalid process id {raw:?}: {reason}")]
    InvalidProcessId { raw: String, reason: String },

    #[error("invalid sum {raw:?}: {reason}")]
    InvalidSum { raw: String, reason: String },

    #[error("invalid fragment: {reason}")]
    InvalidFragment { reason: String },

    #[error("invalid journal spec for {journal:?}: {reason}")]
    InvalidSpec { journal: String, reason: String },
}

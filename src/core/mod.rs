//! Core domain types for the journal broker.
//!
//! Module order follows type dependency order:
//! - time: wall-clock milliseconds
//! - error: validation errors
//! - sum: SHA-1 content sums and running summers
//! - codec: fragment compression codecs
//! - journal: journal names, specs, access flags
//! - route: process ids and journal routes
//! - fragment: the content-addressed fragment descriptor
//! - limits: broker safety limits

pub mod codec;
pub mod error;
pub mod fragment;
pub mod journal;
pub mod limits;
pub mod route;
pub mod sum;
pub mod time;

pub use codec::CompressionCodec;
pub use error::CoreError;
pub use fragment::Fragment;
pub use journal::{AccessMode, FragmentParams, JournalName, JournalSpec};
pub use limits::Limits;
pub use route::{ProcessId, Route};
pub use sum::{SUM_LEN, Sha1Sum, Summer};
pub use time::unix_ms;

#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod coord;
pub mod core;
pub mod error;
pub mod signal;
pub mod store;
pub mod telemetry;
pub mod test_support;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export core types at crate root for convenience
pub use crate::core::{
    AccessMode, CompressionCodec, CoreError, Fragment, FragmentParams, JournalName, JournalSpec,
    Limits, ProcessId, Route, Sha1Sum, Summer, unix_ms,
};

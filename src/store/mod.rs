//! The blob-store boundary.
//!
//! Fragments are offloaded to stores addressed by a root URL. The broker
//! consumes stores through [`FragmentStore`]: persist by content path, list
//! a journal's fragments back, and serve byte ranges. [`fs::FileSystemStore`]
//! is the bundled implementation; object-store adapters live outside this
//! crate behind the same contract.

pub mod fs;
pub mod persist;

pub use fs::FileSystemStore;
pub use persist::{PersistRequest, Persister};

use bytes::Bytes;
use thiserror::Error;

use crate::core::{CompressionCodec, Fragment, JournalName};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<std::path::PathBuf>,
        source: std::io::Error,
    },

    #[error("no store registered for root {0:?}")]
    UnknownStore(String),

    #[error("store cannot transcode codec {0}")]
    UnsupportedCodec(CompressionCodec),

    #[error("offset {offset} outside fragment extent [{begin}, {end})")]
    OffsetOutOfRange { offset: u64, begin: u64, end: u64 },

    #[error("corrupt store entry at {path:?}: {reason}")]
    Corrupt {
        path: Option<std::path::PathBuf>,
        reason: String,
    },
}

pub trait FragmentStore: Send + Sync {
    /// The root URL this store serves; recorded as fragments'
    /// `backing_store`.
    fn root(&self) -> &str;

    /// Write a fragment's content at its content path. Idempotent: the
    /// path is content-addressed, so an existing entry is already correct.
    fn persist(&self, fragment: &Fragment, content: &[u8]) -> Result<(), StoreError>;

    /// List the journal's persisted fragments.
    fn list(&self, journal: &JournalName) -> Result<Vec<Fragment>, StoreError>;

    /// Read up to `max_len` decompressed bytes of `fragment` starting at
    /// journal offset `offset`.
    fn read(&self, fragment: &Fragment, offset: u64, max_len: usize) -> Result<Bytes, StoreError>;

    /// A direct URL for the fragment's content.
    fn url_for(&self, fragment: &Fragment) -> String;
}

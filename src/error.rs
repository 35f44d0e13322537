use thiserror::Error;

use crate::broker::AppendError;
use crate::coord::CoordError;
use crate::core::CoreError;
use crate::store::StoreError;

/// Crate-level convenience error.
///
/// A thin wrapper over the canonical per-layer errors; most APIs return
/// their own error type and callers only reach for this at binary or
/// harness boundaries.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Append(#[from] AppendError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

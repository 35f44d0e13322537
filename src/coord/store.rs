//! The coordination-store trait and its wire types.

use bytes::Bytes;
use crossbeam::channel::Receiver;
use thiserror::Error;

/// A monotonic store revision. Revision 0 is "before any write".
pub type Revision = u64;

/// An opaque lease handle. Keys written under a lease are deleted when the
/// lease is revoked or expires.
pub type LeaseId = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    pub create_revision: Revision,
    pub mod_revision: Revision,
    /// Modification count since creation; compares target this.
    pub version: u64,
    pub lease: Option<LeaseId>,
}

#[derive(Clone, Debug)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, revision: Revision },
}

/// One applied revision's worth of watch events. Batches arrive in revision
/// order with no gaps; a batch may carry no events for a watched prefix.
#[derive(Clone, Debug)]
pub struct WatchBatch {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

#[derive(Clone, Debug)]
pub enum Compare {
    /// The key's version equals `version` (0 means the key is absent).
    VersionEq { key: String, version: u64 },
}

#[derive(Clone, Debug)]
pub enum Op {
    Put {
        key: String,
        value: Bytes,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
}

/// A compare-and-swap transaction: all compares must hold for the success
/// ops to apply, atomically, at a single revision.
#[derive(Clone, Debug, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<Op>,
}

#[derive(Clone, Copy, Debug)]
pub struct TxnOutcome {
    pub succeeded: bool,
    /// The store revision after the transaction (unchanged if it failed).
    pub revision: Revision,
}

#[derive(Debug, Error)]
pub enum CoordError {
    #[error("coordination store is closed")]
    Closed,

    #[error("unknown lease {0}")]
    UnknownLease(LeaseId),
}

pub trait CoordStore: Send + Sync {
    /// A stable identity for this store; proxied requests across clusters
    /// are rejected by comparing it.
    fn cluster_id(&self) -> u64;

    /// A point-in-time copy of every key under `prefix`.
    fn snapshot(&self, prefix: &str) -> (Revision, Vec<KeyValue>);

    /// Watch `prefix` for changes after `from`. Every revision applied
    /// after `from` is delivered exactly once, in order.
    fn watch(&self, prefix: &str, from: Revision) -> Receiver<WatchBatch>;

    fn txn(&self, txn: Txn) -> Result<TxnOutcome, CoordError>;

    fn put(
        &self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
    ) -> Result<Revision, CoordError>;

    fn grant_lease(&self) -> LeaseId;

    /// Revoke a lease, deleting all keys written under it at one revision.
    fn revoke_lease(&self, lease: LeaseId) -> Result<Revision, CoordError>;
}

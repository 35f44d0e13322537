//! The coordination-store boundary.
//!
//! The broker consumes a linearizable, revisioned, watchable key-value store
//! with leases and multi-key compare-and-swap transactions through the
//! narrow [`CoordStore`] trait. [`mem::MemStore`] is the in-process
//! implementation used by tests and single-node deployments;
//! [`mirror::Mirror`] is the process-wide replica of the broker keyspace
//! every resolution reads from.

pub mod keys;
pub mod mem;
pub mod mirror;
pub mod store;

pub use keys::{Assignment, BrokerSpec};
pub use mem::MemStore;
pub use mirror::{Mirror, MirrorState};
pub use store::{
    Compare, CoordError, CoordStore, KeyValue, LeaseId, Op, Revision, Txn, TxnOutcome, WatchBatch,
    WatchEvent,
};

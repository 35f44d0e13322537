//! In-memory coordination store.
//!
//! Linearizable under one mutex, with full watch history replay so watchers
//! may start from any past revision. Used by the test harness and by
//! single-process deployments; a clustered deployment substitutes an
//! external store behind the same trait.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, unbounded};
use rand::RngCore;

use super::store::{
    Compare, CoordError, CoordStore, KeyValue, LeaseId, Op, Revision, Txn, TxnOutcome, WatchBatch,
    WatchEvent,
};

pub struct MemStore {
    cluster_id: u64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    revision: Revision,
    kv: BTreeMap<String, Stored>,
    history: Vec<WatchBatch>,
    watchers: Vec<Watcher>,
    next_lease: LeaseId,
    leases: BTreeMap<LeaseId, BTreeSet<String>>,
}

#[derive(Clone)]
struct Stored {
    value: Bytes,
    create_revision: Revision,
    mod_revision: Revision,
    version: u64,
    lease: Option<LeaseId>,
}

struct Watcher {
    prefix: String,
    tx: Sender<WatchBatch>,
}

impl MemStore {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        Self {
            cluster_id: rng.next_u64(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mem store lock poisoned")
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn kv_at(&self, key: &str) -> Option<KeyValue> {
        self.kv.get(key).map(|s| KeyValue {
            key: key.to_string(),
            value: s.value.clone(),
            create_revision: s.create_revision,
            mod_revision: s.mod_revision,
            version: s.version,
            lease: s.lease,
        })
    }

    fn check(&self, compare: &Compare) -> bool {
        match compare {
            Compare::VersionEq { key, version } => {
                let current = self.kv.get(key).map(|s| s.version).unwrap_or(0);
                current == *version
            }
        }
    }

    /// Apply ops at one new revision and broadcast the resulting batch.
    fn commit(&mut self, ops: Vec<Op>) -> Revision {
        self.revision += 1;
        let revision = self.revision;
        let mut events = Vec::with_capacity(ops.len());

        for op in ops {
            match op {
                Op::Put { key, value, lease } => {
                    let stored = match self.kv.get(&key) {
                        Some(prior) => Stored {
                            value,
                            create_revision: prior.create_revision,
                            mod_revision: revision,
                            version: prior.version + 1,
                            lease,
                        },
                        None => Stored {
                            value,
                            create_revision: revision,
                            mod_revision: revision,
                            version: 1,
                            lease,
                        },
                    };
                    if let Some(prior_lease) = self.kv.get(&key).and_then(|s| s.lease)
                        && Some(prior_lease) != lease
                        && let Some(keys) = self.leases.get_mut(&prior_lease)
                    {
                        keys.remove(&key);
                    }
                    if let Some(lease) = lease {
                        self.leases.entry(lease).or_default().insert(key.clone());
                    }
                    self.kv.insert(key.clone(), stored);
                    events.push(WatchEvent::Put(self.kv_at(&key).expect("just inserted")));
                }
                Op::Delete { key } => {
                    if let Some(prior) = self.kv.remove(&key) {
                        if let Some(lease) = prior.lease
                            && let Some(keys) = self.leases.get_mut(&lease)
                        {
                            keys.remove(&key);
                        }
                        events.push(WatchEvent::Delete { key, revision });
                    }
                }
            }
        }

        let batch = WatchBatch { revision, events };
        self.history.push(batch.clone());
        self.watchers.retain(|w| {
            let filtered = filter_batch(&batch, &w.prefix);
            w.tx.send(filtered).is_ok()
        });
        revision
    }
}

fn filter_batch(batch: &WatchBatch, prefix: &str) -> WatchBatch {
    WatchBatch {
        revision: batch.revision,
        events: batch
            .events
            .iter()
            .filter(|event| match event {
                WatchEvent::Put(kv) => kv.key.starts_with(prefix),
                WatchEvent::Delete { key, .. } => key.starts_with(prefix),
            })
            .cloned()
            .collect(),
    }
}

impl CoordStore for MemStore {
    fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    fn snapshot(&self, prefix: &str) -> (Revision, Vec<KeyValue>) {
        let inner = self.lock();
        let kvs = inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| inner.kv_at(k).expect("ranged key present"))
            .collect();
        (inner.revision, kvs)
    }

    fn watch(&self, prefix: &str, from: Revision) -> Receiver<WatchBatch> {
        let mut inner = self.lock();
        let (tx, rx) = unbounded();
        // Replay applied history past `from` before going live; the lock
        // makes replay-then-subscribe atomic.
        for batch in &inner.history {
            if batch.revision > from {
                let _ = tx.send(filter_batch(batch, prefix));
            }
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        rx
    }

    fn txn(&self, txn: Txn) -> Result<TxnOutcome, CoordError> {
        let mut inner = self.lock();
        if !txn.compares.iter().all(|c| inner.check(c)) {
            return Ok(TxnOutcome {
                succeeded: false,
                revision: inner.revision,
            });
        }
        let revision = inner.commit(txn.success);
        Ok(TxnOutcome {
            succeeded: true,
            revision,
        })
    }

    fn put(
        &self,
        key: &str,
        value: Bytes,
        lease: Option<LeaseId>,
    ) -> Result<Revision, CoordError> {
        let mut inner = self.lock();
        Ok(inner.commit(vec![Op::Put {
            key: key.to_string(),
            value,
            lease,
        }]))
    }

    fn grant_lease(&self) -> LeaseId {
        let mut inner = self.lock();
        inner.next_lease += 1;
        inner.next_lease
    }

    fn revoke_lease(&self, lease: LeaseId) -> Result<Revision, CoordError> {
        let mut inner = self.lock();
        let Some(keys) = inner.leases.remove(&lease) else {
            return Err(CoordError::UnknownLease(lease));
        };
        let ops = keys.into_iter().map(|key| Op::Delete { key }).collect();
        Ok(inner.commit(ops))
    }
}

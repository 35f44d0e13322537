//! The process-wide mirror of the broker keyspace.
//!
//! One mirror per process tracks the coordination store's keys under the
//! broker prefix, at a single revision. Resolvers take read locks against
//! it; the watch thread and only the watch thread writes. Revision waits
//! are channel-based so waiters remain cancellable.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Sender, bounded};

use crate::signal::{Cancelled, SignalRx};

use super::store::{CoordStore, KeyValue, Revision, WatchBatch, WatchEvent};

pub struct MirrorState {
    pub revision: Revision,
    pub cluster_id: u64,
    keys: BTreeMap<String, KeyValue>,
}

impl MirrorState {
    pub fn get(&self, key: &str) -> Option<&KeyValue> {
        self.keys.get(key)
    }

    pub fn prefixed<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a KeyValue> {
        self.keys
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv)
    }
}

type Observer = Box<dyn Fn(&MirrorState) + Send + Sync>;

pub struct Mirror {
    prefix: String,
    state: RwLock<MirrorState>,
    waiters: std::sync::Mutex<Vec<Waiter>>,
    observers: RwLock<Vec<Observer>>,
}

struct Waiter {
    revision: Revision,
    tx: Sender<()>,
}

impl Mirror {
    pub fn new(prefix: impl Into<String>, cluster_id: u64) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.into(),
            state: RwLock::new(MirrorState {
                revision: 0,
                cluster_id,
                keys: BTreeMap::new(),
            }),
            waiters: std::sync::Mutex::new(Vec::new()),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn read(&self) -> RwLockReadGuard<'_, MirrorState> {
        self.state.read().expect("mirror lock poisoned")
    }

    /// Register a callback invoked, under the mirror's write lock, after
    /// each applied batch. Observers must not re-enter the mirror.
    pub fn register_observer(&self, observer: impl Fn(&MirrorState) + Send + Sync + 'static) {
        self.observers
            .write()
            .expect("observer lock poisoned")
            .push(Box::new(observer));
    }

    /// Block until the mirror reaches `revision`, or `cancel` fires.
    pub fn wait_for_revision(&self, revision: Revision, cancel: &SignalRx) -> Result<(), Cancelled> {
        if self.read().revision >= revision {
            return Ok(());
        }
        let (tx, rx) = bounded(1);
        self.waiters
            .lock()
            .expect("waiter lock poisoned")
            .push(Waiter { revision, tx });
        // Re-check: the batch may have landed between the read and the
        // waiter registration.
        if self.read().revision >= revision {
            return Ok(());
        }
        crossbeam::select! {
            recv(rx) -> _ => Ok(()),
            recv(cancel.receiver()) -> _ => Err(Cancelled),
        }
    }

    /// Apply one watch batch: update keys, advance the revision, notify
    /// observers, then release revision waiters.
    pub fn apply(&self, batch: WatchBatch) {
        {
            let mut state = self.state.write().expect("mirror lock poisoned");
            for event in batch.events {
                match event {
                    WatchEvent::Put(kv) => {
                        state.keys.insert(kv.key.clone(), kv);
                    }
                    WatchEvent::Delete { key, .. } => {
                        state.keys.remove(&key);
                    }
                }
            }
            state.revision = batch.revision;

            let observers = self.observers.read().expect("observer lock poisoned");
            for observer in observers.iter() {
                observer(&state);
            }
        }

        let mut waiters = self.waiters.lock().expect("waiter lock poisoned");
        let revision = self.read().revision;
        waiters.retain(|w| {
            if w.revision <= revision {
                let _ = w.tx.send(());
                false
            } else {
                true
            }
        });
    }

    /// Seed the mirror from a store snapshot, then watch it on a dedicated
    /// thread until `shutdown` fires.
    pub fn bootstrap_and_watch(
        self: &Arc<Self>,
        store: Arc<dyn CoordStore>,
        shutdown: SignalRx,
    ) -> JoinHandle<()> {
        let (revision, kvs) = store.snapshot(&self.prefix);
        self.apply(WatchBatch {
            revision,
            events: kvs.into_iter().map(WatchEvent::Put).collect(),
        });

        let mirror = Arc::clone(self);
        let rx = store.watch(&self.prefix, revision);
        thread::spawn(move || {
            loop {
                crossbeam::select! {
                    recv(rx) -> batch => {
                        match batch {
                            Ok(batch) => mirror.apply(batch),
                            Err(_) => break,
                        }
                    }
                    recv(shutdown.receiver()) -> _ => break,
                }
            }
            tracing::debug!(prefix = %mirror.prefix, "mirror watch stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::mem::MemStore;
    use crate::signal;
    use bytes::Bytes;
    use std::time::Duration;

    #[test]
    fn bootstrap_seeds_existing_keys() {
        let store = Arc::new(MemStore::new());
        store
            .put("/p/items/a", Bytes::from_static(b"1"), None)
            .unwrap();
        let mirror = Mirror::new("/p", store.cluster_id());
        let _join = mirror.bootstrap_and_watch(store.clone(), signal::never());

        let state = mirror.read();
        assert!(state.get("/p/items/a").is_some());
        assert!(state.revision >= 1);
    }

    #[test]
    fn watch_applies_and_wakes_waiters() {
        let store = Arc::new(MemStore::new());
        let mirror = Mirror::new("/p", store.cluster_id());
        let _join = mirror.bootstrap_and_watch(store.clone(), signal::never());

        let waiter = {
            let mirror = Arc::clone(&mirror);
            thread::spawn(move || mirror.wait_for_revision(1, &signal::never()))
        };
        thread::sleep(Duration::from_millis(20));
        store.put("/p/k", Bytes::from_static(b"v"), None).unwrap();
        waiter.join().unwrap().unwrap();
        assert!(mirror.read().get("/p/k").is_some());
    }

    #[test]
    fn wait_is_cancellable() {
        let store = Arc::new(MemStore::new());
        let mirror = Mirror::new("/p", store.cluster_id());
        let (cancel, cancel_rx) = signal::signal();
        let waiter = {
            let mirror = Arc::clone(&mirror);
            thread::spawn(move || mirror.wait_for_revision(99, &cancel_rx))
        };
        cancel.fire();
        assert_eq!(waiter.join().unwrap(), Err(Cancelled));
    }

    #[test]
    fn observers_run_after_each_batch() {
        let store = Arc::new(MemStore::new());
        let mirror = Mirror::new("/p", store.cluster_id());
        let (tx, rx) = bounded(4);
        mirror.register_observer(move |state| {
            let _ = tx.send(state.revision);
        });
        let _join = mirror.bootstrap_and_watch(store.clone(), signal::never());

        let rev = store.put("/p/k", Bytes::from_static(b"v"), None).unwrap();
        // Bootstrap apply plus the live batch.
        let mut seen = vec![rx.recv().unwrap()];
        seen.push(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        assert!(seen.contains(&rev));
    }
}

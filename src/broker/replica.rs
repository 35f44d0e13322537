//! Per-journal local state.
//!
//! A replica owns exactly one spool and exactly one pipeline slot, each
//! modeled as a capacity-1 mailbox: whoever holds the value owns it and
//! must put it back on every path. The replica also owns the fragment
//! index and the store refresh loop, and its shutdown signal scopes every
//! thread serving the journal.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded};
use rand::Rng;

use crate::core::{Fragment, FragmentParams, JournalName};
use crate::signal::{Signal, SignalRx, signal};
use crate::store::{FragmentStore, PersistRequest};

use super::index::FragmentIndex;
use super::pipeline::Pipeline;
use super::spool::{Spool, SpoolObserver};

pub struct Replica {
    pub journal: JournalName,
    pub index: Arc<FragmentIndex>,
    spool_tx: Sender<Spool>,
    spool_rx: Receiver<Spool>,
    pipeline_tx: Sender<Option<Arc<Pipeline>>>,
    pipeline_rx: Receiver<Option<Arc<Pipeline>>>,
    shutdown: Mutex<Option<Signal>>,
    shutdown_rx: SignalRx,
}

impl Replica {
    pub fn new(
        journal: JournalName,
        params: &FragmentParams,
        persist_tx: Sender<PersistRequest>,
    ) -> Arc<Self> {
        let index = Arc::new(FragmentIndex::new());
        let (spool_tx, spool_rx) = bounded(1);
        let (pipeline_tx, pipeline_rx) = bounded(1);
        let (shutdown, shutdown_rx) = signal();

        let observer = Arc::new(IndexObserver {
            index: Arc::clone(&index),
            persist_tx,
            store_root: params.stores.first().cloned(),
        });
        spool_tx
            .send(Spool::new(journal.clone(), params.codec, observer))
            .expect("fresh spool mailbox has capacity");
        pipeline_tx
            .send(None)
            .expect("fresh pipeline mailbox has capacity");

        Arc::new(Self {
            journal,
            index,
            spool_tx,
            spool_rx,
            pipeline_tx,
            pipeline_rx,
            shutdown: Mutex::new(Some(shutdown)),
            shutdown_rx,
        })
    }

    /// The spool mailbox. Receiving takes exclusive ownership; the holder
    /// must `return_spool` on every path.
    pub fn spool_slot(&self) -> &Receiver<Spool> {
        &self.spool_rx
    }

    pub fn return_spool(&self, spool: Spool) {
        let _ = self.spool_tx.send(spool);
    }

    pub fn spool_return_tx(&self) -> Sender<Spool> {
        self.spool_tx.clone()
    }

    /// The pipeline mailbox. `None` means the previous holder hit a send
    /// error and the next appender must build a fresh pipeline.
    pub fn pipeline_slot(&self) -> &Receiver<Option<Arc<Pipeline>>> {
        &self.pipeline_rx
    }

    pub fn return_pipeline(&self, pipeline: Option<Arc<Pipeline>>) {
        let _ = self.pipeline_tx.send(pipeline);
    }

    pub fn pipeline_return_tx(&self) -> Sender<Option<Arc<Pipeline>>> {
        self.pipeline_tx.clone()
    }

    pub fn shutdown_rx(&self) -> &SignalRx {
        &self.shutdown_rx
    }

    /// Begin replica teardown. Streams and waits scoped to this replica
    /// observe the signal and unwind; the spool's committed state stays in
    /// the index until the process exits.
    pub fn shutdown(&self) {
        if let Some(sig) = self.shutdown.lock().expect("shutdown lock poisoned").take() {
            tracing::info!(journal = %self.journal, "replica shutting down");
            sig.fire();
        }
    }
}

struct IndexObserver {
    index: Arc<FragmentIndex>,
    persist_tx: Sender<PersistRequest>,
    store_root: Option<String>,
}

impl SpoolObserver for IndexObserver {
    fn on_commit(&self, fragment: &Fragment, content: Bytes) {
        self.index.add_local(fragment.clone(), content);
    }

    fn on_complete(&self, fragment: Fragment, content: Bytes) {
        let _ = self.persist_tx.send(PersistRequest {
            fragment,
            content,
            store_root: self.store_root.clone(),
            index: Arc::clone(&self.index),
        });
    }
}

/// Run the replica's remote refresh loop: list the journal's stores every
/// refresh interval (with jitter) and swap the results into the index. The
/// first successful scan opens the index's refresh gate; journals with no
/// stores open it immediately.
pub fn spawn_refresh(
    replica: &Arc<Replica>,
    params: FragmentParams,
    stores: BTreeMap<String, Arc<dyn FragmentStore>>,
) -> JoinHandle<()> {
    let journal = replica.journal.clone();
    let index = Arc::clone(&replica.index);
    let shutdown = replica.shutdown_rx.clone();

    thread::spawn(move || {
        if params.stores.is_empty() {
            index.first_refresh_done();
            return;
        }
        loop {
            let mut merged = Vec::new();
            let mut complete = true;
            for root in &params.stores {
                match stores.get(root) {
                    Some(store) => match store.list(&journal) {
                        Ok(mut listed) => merged.append(&mut listed),
                        Err(err) => {
                            tracing::warn!(journal = %journal, store = %root, "store list failed: {err}");
                            complete = false;
                        }
                    },
                    None => {
                        tracing::error!(journal = %journal, store = %root, "store root not registered");
                        complete = false;
                    }
                }
            }
            if complete {
                index.replace_remote(merged);
            }

            let base = params.refresh_interval_ms.max(100);
            let wait = if complete {
                base + rand::rng().random_range(0..=base / 10)
            } else {
                (base / 10).max(100)
            };
            crossbeam::select! {
                recv(crossbeam::channel::after(Duration::from_millis(wait))) -> _ => {}
                recv(shutdown.receiver()) -> _ => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompressionCodec, JournalName, Sha1Sum};
    use crate::store::FileSystemStore;
    use crossbeam::channel::unbounded;
    use std::time::Instant;

    fn journal() -> JournalName {
        JournalName::parse("a/journal").unwrap()
    }

    #[test]
    fn mailboxes_start_seeded() {
        let (persist_tx, _persist_rx) = unbounded();
        let replica = Replica::new(journal(), &FragmentParams::default(), persist_tx);

        let spool = replica.spool_slot().recv().unwrap();
        assert_eq!(spool.end(), 0);
        assert!(replica.spool_slot().try_recv().is_err());
        replica.return_spool(spool);
        assert!(replica.spool_slot().try_recv().is_ok());

        let slot = replica.pipeline_slot().recv().unwrap();
        assert!(slot.is_none());
        replica.return_pipeline(None);
    }

    #[test]
    fn shutdown_fires_once() {
        let (persist_tx, _persist_rx) = unbounded();
        let replica = Replica::new(journal(), &FragmentParams::default(), persist_tx);
        assert!(!replica.shutdown_rx().is_fired());
        replica.shutdown();
        replica.shutdown(); // Idempotent.
        assert!(replica.shutdown_rx().is_fired());
    }

    #[test]
    fn refresh_gate_opens_without_stores() {
        let (persist_tx, _persist_rx) = unbounded();
        let replica = Replica::new(journal(), &FragmentParams::default(), persist_tx);
        let join = spawn_refresh(&replica, FragmentParams::default(), BTreeMap::new());
        join.join().unwrap();
        assert!(
            replica
                .index
                .wait_for_first_remote_refresh(&crate::signal::never())
                .is_ok()
        );
    }

    #[test]
    fn refresh_populates_remote_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileSystemStore::new(dir.path()).unwrap());
        let root = store.root().to_string();

        let fragment = Fragment {
            journal: journal(),
            begin: 0,
            end: 9,
            sum: Sha1Sum::of(b"foobarbaz"),
            codec: CompressionCodec::None,
            backing_store: None,
            mod_time_ms: 0,
        };
        store.persist(&fragment, b"foobarbaz").unwrap();

        let mut params = FragmentParams::default();
        params.stores = vec![root.clone()];
        let mut stores: BTreeMap<String, Arc<dyn FragmentStore>> = BTreeMap::new();
        stores.insert(root, store);

        let (persist_tx, _persist_rx) = unbounded();
        let replica = Replica::new(journal(), &params, persist_tx);
        let _join = spawn_refresh(&replica, params, stores);

        replica
            .index
            .wait_for_first_remote_refresh(&crate::signal::never())
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while replica.index.end_offset() != 9 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        replica.shutdown();
    }
}

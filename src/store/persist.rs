//! Background persistence of completed fragments.
//!
//! Spool observers queue completed fragments here; one worker drains the
//! queue, writes each fragment to its journal's store, and stamps the
//! replica index with the backing store. Failures retry with a fixed
//! backoff until shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::broker::index::FragmentIndex;
use crate::core::Fragment;
use crate::signal::SignalRx;

use super::FragmentStore;

pub struct PersistRequest {
    pub fragment: Fragment,
    pub content: Bytes,
    /// The journal's first configured store root, if any.
    pub store_root: Option<String>,
    pub index: Arc<FragmentIndex>,
}

pub struct Persister {
    tx: Option<Sender<PersistRequest>>,
    join: Option<JoinHandle<()>>,
}

impl Persister {
    pub fn spawn(
        stores: BTreeMap<String, Arc<dyn FragmentStore>>,
        retry_ms: u64,
        shutdown: SignalRx,
    ) -> Self {
        let (tx, rx) = unbounded::<PersistRequest>();
        let join = thread::spawn(move || run(rx, stores, retry_ms, shutdown));
        Self {
            tx: Some(tx),
            join: Some(join),
        }
    }

    pub fn sender(&self) -> Sender<PersistRequest> {
        self.tx.as_ref().expect("persister running").clone()
    }

    /// Release this handle's sender and wait for the worker. The worker
    /// exits once the shutdown signal fires (draining queued work) or all
    /// senders disconnect.
    pub fn join(mut self) {
        self.tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run(
    rx: Receiver<PersistRequest>,
    stores: BTreeMap<String, Arc<dyn FragmentStore>>,
    retry_ms: u64,
    shutdown: SignalRx,
) {
    loop {
        crossbeam::select! {
            recv(rx) -> req => match req {
                Ok(req) => persist_one(&stores, req, retry_ms, &shutdown),
                Err(_) => return,
            },
            recv(shutdown.receiver()) -> _ => {
                // Best-effort drain: one attempt per queued fragment.
                while let Ok(req) = rx.try_recv() {
                    persist_one(&stores, req, 0, &shutdown);
                }
                return;
            }
        }
    }
}

fn persist_one(
    stores: &BTreeMap<String, Arc<dyn FragmentStore>>,
    req: PersistRequest,
    retry_ms: u64,
    shutdown: &SignalRx,
) {
    let Some(root) = req.store_root else {
        // The journal is not offloaded; content stays resident with the
        // replica.
        return;
    };
    let Some(store) = stores.get(&root) else {
        tracing::error!(
            fragment = %req.fragment,
            store = %root,
            "dropping fragment persist: store root not registered"
        );
        return;
    };

    loop {
        match store.persist(&req.fragment, &req.content) {
            Ok(()) => {
                tracing::debug!(fragment = %req.fragment, store = %root, "fragment persisted");
                req.index.mark_persisted(req.fragment.begin, &root);
                return;
            }
            Err(err) if retry_ms == 0 => {
                tracing::warn!(fragment = %req.fragment, "final persist attempt failed: {err}");
                return;
            }
            Err(err) => {
                tracing::warn!(fragment = %req.fragment, "fragment persist failed, retrying: {err}");
                crossbeam::select! {
                    recv(shutdown.receiver()) -> _ => return,
                    recv(crossbeam::channel::after(Duration::from_millis(retry_ms))) -> _ => {}
                }
            }
        }
    }
}

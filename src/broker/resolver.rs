//! Journal resolution: name + mirror revision → responsible brokers.
//!
//! The resolver reads the mirror under its read lock and returns immutable
//! resolution snapshots. It also maintains the set of local replicas as a
//! mirror observer: assignments appearing for the local member create
//! replicas, assignment changes fire the journal's invalidation signal,
//! and disappearing assignments shut replicas down.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::Sender;
use thiserror::Error;

use crate::coord::keys;
use crate::coord::{Mirror, MirrorState, Revision};
use crate::core::{FragmentParams, JournalName, JournalSpec, ProcessId};
use crate::signal::{self, Cancelled, Signal, SignalRx};
use crate::store::{FragmentStore, PersistRequest};

use super::proto::{Header, Status};
use super::replica::{Replica, spawn_refresh};

/// Parameters of one resolution.
pub struct ResolveArgs<'a> {
    pub journal: JournalName,
    /// Appends require the primary; reads accept any route member.
    pub require_primary: bool,
    /// Whether a remote responsible broker is acceptable (proxying).
    pub may_proxy: bool,
    /// Resolve at or after this mirror revision.
    pub min_revision: Revision,
    /// Header attached by a proxying peer, validated against this process.
    pub proxy_header: Option<&'a Header>,
    pub cancel: &'a SignalRx,
}

/// An immutable resolution snapshot. Never mutated after return;
/// staleness is signalled through `invalidate_rx`.
pub struct Resolution {
    pub status: Status,
    /// `header.process_id` names the process responsible for the request:
    /// the local process when it can serve, else the (possibly remote)
    /// primary, else the local process for error responses.
    pub header: Header,
    pub spec: Option<JournalSpec>,
    pub assignments: Vec<keys::Assignment>,
    pub local_id: ProcessId,
    /// The local replica, when this process is responsible.
    pub replica: Option<Arc<Replica>>,
    /// Fires when the journal's assignments change after this snapshot.
    pub invalidate_rx: SignalRx,
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolution")
            .field("status", &self.status)
            .field("header", &self.header)
            .field("spec", &self.spec)
            .field("assignments", &self.assignments)
            .field("local_id", &self.local_id)
            .finish()
    }
}

impl Resolution {
    pub fn serves_locally(&self) -> bool {
        self.status == Status::Ok && self.header.process_id == self.local_id
    }

    pub fn fragment_params(&self) -> FragmentParams {
        self.spec
            .as_ref()
            .map(|s| s.fragment.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("resolver stopped serving local replicas")]
    Stopped,

    #[error("proxied request cluster id {got:#x} does not match local {want:#x}")]
    ClusterMismatch { got: u64, want: u64 },

    #[error("proxied request process id {got} does not match local {want}")]
    ProcessMismatch { got: ProcessId, want: ProcessId },
}

/// Dependencies a resolver wires into each replica it creates.
pub struct ReplicaDeps {
    pub persist_tx: Sender<PersistRequest>,
    pub stores: BTreeMap<String, Arc<dyn FragmentStore>>,
}

pub struct Resolver {
    mirror: Arc<Mirror>,
    prefix: String,
    local_id: ProcessId,
    deps: ReplicaDeps,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: bool,
    replicas: BTreeMap<JournalName, ReplicaEntry>,
}

struct ReplicaEntry {
    replica: Arc<Replica>,
    invalidate: Option<Signal>,
    invalidate_rx: SignalRx,
    /// Assignment keys and mod-revisions at last observation; any change
    /// fires the invalidation signal.
    fingerprint: Vec<(String, Revision)>,
}

impl Resolver {
    /// Build a resolver and register it as a mirror observer. The mirror
    /// should already be bootstrapped so existing assignments materialize
    /// replicas immediately.
    pub fn new(mirror: Arc<Mirror>, local_id: ProcessId, deps: ReplicaDeps) -> Arc<Self> {
        let resolver = Arc::new(Self {
            prefix: mirror.prefix().to_string(),
            mirror: Arc::clone(&mirror),
            local_id,
            deps,
            inner: Mutex::new(Inner::default()),
        });

        // Register before the initial sweep: observation is idempotent,
        // and this order cannot miss a batch landing in between.
        let observer = Arc::clone(&resolver);
        mirror.register_observer(move |state| observer.observe(state));
        {
            let state = mirror.read();
            resolver.observe(&state);
        }
        resolver
    }

    pub fn local_id(&self) -> &ProcessId {
        &self.local_id
    }

    pub fn mirror(&self) -> &Arc<Mirror> {
        &self.mirror
    }

    pub fn resolve(&self, args: ResolveArgs<'_>) -> Result<Resolution, ResolveError> {
        if args.min_revision > 0 {
            self.mirror.wait_for_revision(args.min_revision, args.cancel)?;
        }

        let mut state = self.mirror.read();
        if let Some(hdr) = args.proxy_header {
            if hdr.cluster_id != state.cluster_id {
                return Err(ResolveError::ClusterMismatch {
                    got: hdr.cluster_id,
                    want: state.cluster_id,
                });
            }
            if hdr.process_id != self.local_id {
                return Err(ResolveError::ProcessMismatch {
                    got: hdr.process_id.clone(),
                    want: self.local_id.clone(),
                });
            }
            if hdr.revision > state.revision {
                drop(state);
                self.mirror.wait_for_revision(hdr.revision, args.cancel)?;
                state = self.mirror.read();
            }
        }

        let spec = keys::journal_spec(&state, &self.prefix, &args.journal);
        let assignments = keys::journal_assignments(&state, &self.prefix, &args.journal);
        let route = keys::route_of(&assignments);
        let primary = route.primary_id().cloned();

        let status = if spec.is_none() {
            Status::JournalNotFound
        } else if primary.is_none() {
            Status::NoJournalPrimaryBroker
        } else if !args.may_proxy
            && args.require_primary
            && primary.as_ref() != Some(&self.local_id)
        {
            Status::NotJournalPrimaryBroker
        } else if !args.may_proxy && !args.require_primary && !route.contains(&self.local_id) {
            Status::NotJournalBroker
        } else {
            Status::Ok
        };

        let process_id = if status != Status::Ok {
            // Error responses are authored locally.
            self.local_id.clone()
        } else if args.require_primary {
            primary.clone().expect("status OK implies a primary")
        } else if route.contains(&self.local_id) {
            self.local_id.clone()
        } else {
            primary.clone().expect("status OK implies a primary")
        };

        let header = Header {
            process_id,
            route,
            revision: state.revision,
            cluster_id: state.cluster_id,
        };
        drop(state);

        let (replica, invalidate_rx) = if status == Status::Ok
            && header.process_id == self.local_id
        {
            let inner = self.inner.lock().expect("resolver lock poisoned");
            if inner.stopped {
                return Err(ResolveError::Stopped);
            }
            let entry = inner
                .replicas
                .get(&args.journal)
                .unwrap_or_else(|| panic!("expected replica for journal {}", args.journal));
            (Some(Arc::clone(&entry.replica)), entry.invalidate_rx.clone())
        } else {
            (None, signal::never())
        };

        tracing::debug!(
            journal = %args.journal,
            status = %status,
            process = %header.process_id,
            revision = header.revision,
            "resolved"
        );

        Ok(Resolution {
            status,
            header,
            spec,
            assignments,
            local_id: self.local_id.clone(),
            replica,
            invalidate_rx,
        })
    }

    /// Mirror observer: reconcile local replicas with the observed
    /// assignments. Runs under the mirror's write lock; must not re-enter
    /// the mirror.
    fn observe(&self, state: &MirrorState) {
        let mut inner = self.inner.lock().expect("resolver lock poisoned");
        if inner.stopped {
            return;
        }

        let assigned = keys::journals_assigned_to(state, &self.prefix, &self.local_id);
        for journal in &assigned {
            let assignments = keys::journal_assignments(state, &self.prefix, journal);
            let fingerprint: Vec<(String, Revision)> = assignments
                .iter()
                .map(|a| (a.key.clone(), a.mod_revision))
                .collect();

            match inner.replicas.get_mut(journal) {
                Some(entry) => {
                    if entry.fingerprint != fingerprint {
                        entry.fingerprint = fingerprint;
                        let (sig, rx) = signal::signal();
                        if let Some(prior) = entry.invalidate.replace(sig) {
                            prior.fire();
                        }
                        entry.invalidate_rx = rx;
                    }
                }
                None => {
                    let params = keys::journal_spec(state, &self.prefix, journal)
                        .map(|s| s.fragment)
                        .unwrap_or_default();
                    tracing::info!(journal = %journal, "starting local replica");
                    let replica = Replica::new(
                        journal.clone(),
                        &params,
                        self.deps.persist_tx.clone(),
                    );
                    spawn_refresh(&replica, params, self.deps.stores.clone());
                    let (sig, rx) = signal::signal();
                    inner.replicas.insert(
                        journal.clone(),
                        ReplicaEntry {
                            replica,
                            invalidate: Some(sig),
                            invalidate_rx: rx,
                            fingerprint,
                        },
                    );
                }
            }
        }

        let removed: Vec<JournalName> = inner
            .replicas
            .keys()
            .filter(|j| !assigned.contains(j))
            .cloned()
            .collect();
        for journal in removed {
            if let Some(mut entry) = inner.replicas.remove(&journal) {
                if let Some(sig) = entry.invalidate.take() {
                    sig.fire();
                }
                entry.replica.shutdown();
            }
        }
    }

    /// The replica currently serving `journal`, if any. Test-harness and
    /// read-path accessor.
    pub fn replica(&self, journal: &JournalName) -> Option<Arc<Replica>> {
        let inner = self.inner.lock().expect("resolver lock poisoned");
        inner
            .replicas
            .get(journal)
            .map(|entry| Arc::clone(&entry.replica))
    }

    /// Stop serving local replicas; future local resolutions fail with
    /// [`ResolveError::Stopped`].
    pub fn stop_serving(&self) {
        let mut inner = self.inner.lock().expect("resolver lock poisoned");
        inner.stopped = true;
        for (_, mut entry) in std::mem::take(&mut inner.replicas) {
            if let Some(sig) = entry.invalidate.take() {
                sig.fire();
            }
            entry.replica.shutdown();
        }
    }
}

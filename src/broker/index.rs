//! The per-journal fragment index.
//!
//! An offset-ordered view over two fragment sets: local fragments (spool
//! commits and completions, content in memory) and remote fragments (store
//! listings, content behind the blob store). Readers query it; the append
//! FSM gates on its first remote refresh so the write head is never
//! underestimated.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender, bounded};

use crate::core::Fragment;
use crate::signal::{Cancelled, Signal, SignalRx, signal};

/// A queried fragment, with content when it is locally held.
#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub fragment: Fragment,
    pub content: Option<Bytes>,
}

pub struct FragmentIndex {
    inner: RwLock<Inner>,
    first_refresh: Mutex<Option<Signal>>,
    first_refresh_rx: SignalRx,
    wakers: Mutex<Vec<Sender<()>>>,
}

#[derive(Default)]
struct Inner {
    local: BTreeMap<u64, LocalEntry>,
    remote: BTreeMap<u64, Fragment>,
}

struct LocalEntry {
    fragment: Fragment,
    content: Bytes,
}

impl FragmentIndex {
    pub fn new() -> Self {
        let (tx, rx) = signal();
        Self {
            inner: RwLock::new(Inner::default()),
            first_refresh: Mutex::new(Some(tx)),
            first_refresh_rx: rx,
            wakers: Mutex::new(Vec::new()),
        }
    }

    /// The maximum `end` across all known fragments.
    pub fn end_offset(&self) -> u64 {
        let inner = self.read();
        let local = inner.local.values().map(|e| e.fragment.end).max();
        let remote = inner.remote.values().map(|f| f.end).max();
        local.into_iter().chain(remote).max().unwrap_or(0)
    }

    /// Insert or extend a local fragment. Commits of a growing open
    /// fragment land at a stable `begin`, replacing the prior extent.
    pub fn add_local(&self, fragment: Fragment, content: Bytes) {
        debug_assert_eq!(fragment.len() as usize, content.len());
        {
            let mut inner = self.write();
            if let Some((_, prior)) = inner.local.range(..fragment.begin).next_back() {
                debug_assert!(
                    prior.fragment.end <= fragment.begin,
                    "local fragments must not overlap"
                );
            }
            inner
                .local
                .insert(fragment.begin, LocalEntry { fragment, content });
        }
        self.wake();
    }

    /// Record that a local fragment reached a backing store.
    pub fn mark_persisted(&self, begin: u64, store: &str) {
        let mut inner = self.write();
        if let Some(entry) = inner.local.get_mut(&begin) {
            entry.fragment.backing_store = Some(store.to_string());
        }
    }

    /// Atomically swap the remote fragment set from a store refresh. The
    /// first swap releases waiters gated on the initial scan.
    pub fn replace_remote(&self, set: Vec<Fragment>) {
        {
            let mut inner = self.write();
            inner.remote = set.into_iter().map(|f| (f.begin, f)).collect();
        }
        self.first_refresh_done();
        self.wake();
    }

    /// Mark the initial remote scan complete without replacing anything.
    /// Used by journals with no configured stores.
    pub fn first_refresh_done(&self) {
        if let Some(sig) = self
            .first_refresh
            .lock()
            .expect("first refresh lock poisoned")
            .take()
        {
            sig.fire();
        }
    }

    pub fn wait_for_first_remote_refresh(&self, cancel: &SignalRx) -> Result<(), Cancelled> {
        crossbeam::select! {
            recv(self.first_refresh_rx.receiver()) -> _ => Ok(()),
            recv(cancel.receiver()) -> _ => Err(Cancelled),
        }
    }

    /// The fragment covering `offset`, or failing that the first fragment
    /// past it. Local fragments win ties so reads stay in memory.
    pub fn query(&self, offset: u64) -> Option<IndexEntry> {
        let inner = self.read();
        let mut best: Option<IndexEntry> = None;

        let locals = inner.local.values().map(|e| IndexEntry {
            fragment: e.fragment.clone(),
            content: Some(e.content.clone()),
        });
        let remotes = inner.remote.values().map(|f| IndexEntry {
            fragment: f.clone(),
            content: None,
        });
        for candidate in locals.chain(remotes) {
            if candidate.fragment.end <= offset || candidate.fragment.is_empty() {
                continue;
            }
            let replace = match &best {
                None => true,
                Some(current) => {
                    let covers = |e: &IndexEntry| e.fragment.begin <= offset;
                    match (covers(&candidate), covers(current)) {
                        (true, false) => true,
                        (false, true) => false,
                        _ => {
                            candidate.fragment.begin < current.fragment.begin
                                || (candidate.fragment.begin == current.fragment.begin
                                    && candidate.content.is_some()
                                    && current.content.is_none())
                        }
                    }
                }
            };
            if replace {
                best = Some(candidate);
            }
        }
        best
    }

    /// Subscribe to commit wakeups for blocking reads. Each index change
    /// pulses every subscriber once; stale pulses coalesce.
    pub fn subscribe(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        self.wakers.lock().expect("waker lock poisoned").push(tx);
        rx
    }

    fn wake(&self) {
        let mut wakers = self.wakers.lock().expect("waker lock poisoned");
        wakers.retain(|tx| match tx.try_send(()) {
            Ok(()) => true,
            Err(crossbeam::channel::TrySendError::Full(())) => true,
            Err(crossbeam::channel::TrySendError::Disconnected(())) => false,
        });
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("index lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("index lock poisoned")
    }
}

impl Default for FragmentIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompressionCodec, JournalName, Sha1Sum};
    use crate::signal;

    fn fragment(begin: u64, end: u64) -> Fragment {
        let content: Vec<u8> = (begin..end).map(|i| i as u8).collect();
        Fragment {
            journal: JournalName::parse("a/journal").unwrap(),
            begin,
            end,
            sum: Sha1Sum::of(&content),
            codec: CompressionCodec::None,
            backing_store: None,
            mod_time_ms: 0,
        }
    }

    fn content_for(f: &Fragment) -> Bytes {
        Bytes::from((f.begin..f.end).map(|i| i as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn end_offset_spans_local_and_remote() {
        let index = FragmentIndex::new();
        assert_eq!(index.end_offset(), 0);

        let f = fragment(0, 9);
        index.add_local(f.clone(), content_for(&f));
        assert_eq!(index.end_offset(), 9);

        index.replace_remote(vec![fragment(9, 30)]);
        assert_eq!(index.end_offset(), 30);
    }

    #[test]
    fn query_prefers_covering_then_local() {
        let index = FragmentIndex::new();
        let local = fragment(0, 9);
        index.add_local(local.clone(), content_for(&local));
        index.replace_remote(vec![fragment(0, 9), fragment(9, 20)]);

        // Covered by both sets: the local copy wins.
        let entry = index.query(3).unwrap();
        assert_eq!(entry.fragment.begin, 0);
        assert!(entry.content.is_some());

        // Covered only remotely.
        let entry = index.query(12).unwrap();
        assert_eq!(entry.fragment.begin, 9);
        assert!(entry.content.is_none());

        // Past the head.
        assert!(index.query(20).is_none());
    }

    #[test]
    fn query_skips_gaps_forward() {
        let index = FragmentIndex::new();
        index.replace_remote(vec![fragment(10, 20)]);
        let entry = index.query(3).unwrap();
        assert_eq!(entry.fragment.begin, 10);
    }

    #[test]
    fn growing_commit_replaces_open_fragment() {
        let index = FragmentIndex::new();
        let f = fragment(0, 9);
        index.add_local(f.clone(), content_for(&f));
        let grown = fragment(0, 13);
        index.add_local(grown.clone(), content_for(&grown));

        let entry = index.query(10).unwrap();
        assert_eq!(entry.fragment.end, 13);
        assert_eq!(index.end_offset(), 13);
    }

    #[test]
    fn first_refresh_gate() {
        let index = FragmentIndex::new();
        let (cancel, cancel_rx) = signal::signal();
        cancel.fire();
        assert_eq!(
            index.wait_for_first_remote_refresh(&cancel_rx),
            Err(Cancelled)
        );

        index.replace_remote(Vec::new());
        assert_eq!(
            index.wait_for_first_remote_refresh(&signal::never()),
            Ok(())
        );
    }

    #[test]
    fn subscribers_wake_on_change() {
        let index = FragmentIndex::new();
        let rx = index.subscribe();
        assert!(rx.try_recv().is_err());

        let f = fragment(0, 9);
        index.add_local(f.clone(), content_for(&f));
        assert!(rx.try_recv().is_ok());

        // Coalesced: two changes, one pending pulse.
        index.replace_remote(vec![fragment(0, 9)]);
        index.mark_persisted(0, "file:///store");
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig {
            cases: 64, .. proptest::prelude::ProptestConfig::default()
        })]

        // Remote refreshes that retain previously committed fragments
        // never shrink the observed write head.
        #[test]
        fn end_offset_is_monotonic_under_growing_refreshes(
            lens in proptest::collection::vec(1u64..64, 1..24),
        ) {
            let index = FragmentIndex::new();
            let mut fragments = Vec::new();
            let mut begin = 0u64;
            for len in lens {
                fragments.push(fragment(begin, begin + len));
                begin += len;
            }

            let mut last_head = 0u64;
            for prefix in 1..=fragments.len() {
                index.replace_remote(fragments[..prefix].to_vec());
                let head = index.end_offset();
                proptest::prop_assert!(head >= last_head);
                proptest::prop_assert_eq!(head, fragments[prefix - 1].end);
                last_head = head;
            }
        }
    }

    #[test]
    fn mark_persisted_records_store() {
        let index = FragmentIndex::new();
        let f = fragment(0, 9);
        index.add_local(f.clone(), content_for(&f));
        index.mark_persisted(0, "file:///store");
        let entry = index.query(0).unwrap();
        assert_eq!(entry.fragment.backing_store.as_deref(), Some("file:///store"));
    }
}

//! Broker keyspace layout and decoding.
//!
//! Under the configured prefix:
//!
//! - `items/<journal>` — the [`JournalSpec`], canonical JSON.
//! - `members/<zone>#<suffix>` — the [`BrokerSpec`], written with the
//!   member's lease.
//! - `assign/<journal>#<zone>#<suffix>#<slot>` — the member's advertised
//!   [`Route`] for the journal, written with the member's lease.
//!
//! The coordination key is the source of truth for entity naming; decoded
//! specs must agree with the key they were read from.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::core::{JournalName, JournalSpec, ProcessId, Route};

use super::mirror::MirrorState;
use super::store::{CoordError, CoordStore, KeyValue, LeaseId, Revision};

/// A broker process advertisement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSpec {
    pub id: ProcessId,
    pub addr: String,
}

/// One decoded assignment record.
#[derive(Clone, Debug)]
pub struct Assignment {
    pub journal: JournalName,
    pub member: ProcessId,
    pub slot: u32,
    /// The route this member currently advertises for the journal.
    pub advertised: Route,
    pub key: String,
    pub kv_version: u64,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

pub fn item_key(prefix: &str, journal: &JournalName) -> String {
    format!("{prefix}/items/{journal}")
}

pub fn items_prefix(prefix: &str) -> String {
    format!("{prefix}/items/")
}

pub fn member_key(prefix: &str, id: &ProcessId) -> String {
    format!("{prefix}/members/{id}")
}

pub fn assignment_key(prefix: &str, journal: &JournalName, member: &ProcessId, slot: u32) -> String {
    format!("{prefix}/assign/{journal}#{member}#{slot}")
}

pub fn assignment_prefix(prefix: &str, journal: &JournalName) -> String {
    format!("{prefix}/assign/{journal}#")
}

pub fn assignments_prefix(prefix: &str) -> String {
    format!("{prefix}/assign/")
}

/// Decode an assignment from its key and advertised-route value.
pub fn parse_assignment(prefix: &str, kv: &KeyValue) -> Option<Assignment> {
    let rest = kv.key.strip_prefix(&assignments_prefix(prefix))?;
    // The journal may contain '/', never '#'; zone and suffix never
    // contain '#'. Split from the right.
    let mut parts = rest.rsplitn(4, '#');
    let slot = parts.next()?.parse::<u32>().ok()?;
    let suffix = parts.next()?;
    let zone = parts.next()?;
    let journal = parts.next()?;

    let journal = JournalName::parse(journal).ok()?;
    let member = ProcessId::new(zone, suffix).ok()?;
    let advertised: Route = serde_json::from_slice(&kv.value).ok()?;

    Some(Assignment {
        journal,
        member,
        slot,
        advertised,
        key: kv.key.clone(),
        kv_version: kv.version,
        mod_revision: kv.mod_revision,
        lease: kv.lease,
    })
}

/// The journal's spec at the mirror's revision, if present and coherent
/// with its key.
pub fn journal_spec(state: &MirrorState, prefix: &str, journal: &JournalName) -> Option<JournalSpec> {
    let kv = state.get(&item_key(prefix, journal))?;
    let spec: JournalSpec = serde_json::from_slice(&kv.value).ok()?;
    if &spec.name != journal {
        tracing::error!(key = %kv.key, spec = %spec.name, "journal spec name does not match its key");
        return None;
    }
    Some(spec)
}

/// All assignments of a journal, ordered by slot.
pub fn journal_assignments(
    state: &MirrorState,
    prefix: &str,
    journal: &JournalName,
) -> Vec<Assignment> {
    let mut assignments: Vec<_> = state
        .prefixed(&assignment_prefix(prefix, journal))
        .filter_map(|kv| parse_assignment(prefix, kv))
        .collect();
    assignments.sort_by_key(|a| a.slot);
    assignments
}

/// The live route implied by a journal's assignments: members in slot
/// order, primary at slot 0.
pub fn route_of(assignments: &[Assignment]) -> Route {
    let members: Vec<_> = assignments.iter().map(|a| a.member.clone()).collect();
    let primary = assignments.iter().position(|a| a.slot == 0);
    Route { members, primary }
}

pub fn member_addr(state: &MirrorState, prefix: &str, id: &ProcessId) -> Option<String> {
    let kv = state.get(&member_key(prefix, id))?;
    let spec: BrokerSpec = serde_json::from_slice(&kv.value).ok()?;
    Some(spec.addr)
}

/// Journals with at least one assignment to `member`.
pub fn journals_assigned_to(
    state: &MirrorState,
    prefix: &str,
    member: &ProcessId,
) -> Vec<JournalName> {
    let mut journals: Vec<_> = state
        .prefixed(&assignments_prefix(prefix))
        .filter_map(|kv| parse_assignment(prefix, kv))
        .filter(|a| &a.member == member)
        .map(|a| a.journal)
        .collect();
    journals.sort();
    journals.dedup();
    journals
}

/// Create or replace a journal spec.
pub fn create_journal(
    store: &dyn CoordStore,
    prefix: &str,
    spec: &JournalSpec,
) -> Result<Revision, CoordError> {
    spec.validate().expect("journal spec must validate");
    let value = serde_json::to_vec(spec).expect("journal spec serializes");
    store.put(&item_key(prefix, &spec.name), Bytes::from(value), None)
}

/// Write one assignment record advertising `route`.
pub fn assign(
    store: &dyn CoordStore,
    prefix: &str,
    journal: &JournalName,
    member: &ProcessId,
    slot: u32,
    route: &Route,
    lease: Option<LeaseId>,
) -> Result<Revision, CoordError> {
    let value = serde_json::to_vec(route).expect("route serializes");
    store.put(
        &assignment_key(prefix, journal, member, slot),
        Bytes::from(value),
        lease,
    )
}

/// Register the local member under its lease.
pub fn register_member(
    store: &dyn CoordStore,
    prefix: &str,
    spec: &BrokerSpec,
    lease: LeaseId,
) -> Result<Revision, CoordError> {
    let value = serde_json::to_vec(spec).expect("broker spec serializes");
    store.put(&member_key(prefix, &spec.id), Bytes::from(value), Some(lease))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::mem::MemStore;
    use crate::coord::mirror::Mirror;
    use crate::signal;
    use std::sync::Arc;

    fn journal(raw: &str) -> JournalName {
        JournalName::parse(raw).unwrap()
    }

    fn pid(raw: &str) -> ProcessId {
        ProcessId::parse(raw).unwrap()
    }

    fn mirrored(store: &Arc<MemStore>) -> Arc<Mirror> {
        let mirror = Mirror::new("/plume", store.cluster_id());
        let store: Arc<dyn CoordStore> = Arc::clone(store) as _;
        let _join = mirror.bootstrap_and_watch(store, signal::never());
        mirror
    }

    #[test]
    fn assignment_key_roundtrip() {
        let store = Arc::new(MemStore::new());
        let route = Route {
            members: vec![pid("z#a"), pid("z#b")],
            primary: Some(0),
        };
        assign(
            store.as_ref(),
            "/plume",
            &journal("a/journal"),
            &pid("z#a"),
            0,
            &route,
            None,
        )
        .unwrap();

        let (_, kvs) = store.snapshot("/plume/assign/");
        let assignment = parse_assignment("/plume", &kvs[0]).unwrap();
        assert_eq!(assignment.journal, journal("a/journal"));
        assert_eq!(assignment.member, pid("z#a"));
        assert_eq!(assignment.slot, 0);
        assert_eq!(assignment.advertised, route);
    }

    #[test]
    fn route_derivation_orders_by_slot() {
        let store = Arc::new(MemStore::new());
        let spec = JournalSpec::new(journal("a/journal"));
        create_journal(store.as_ref(), "/plume", &spec).unwrap();
        let route = Route::default();
        for (member, slot) in [(pid("z#b"), 1), (pid("z#a"), 0)] {
            assign(
                store.as_ref(),
                "/plume",
                &journal("a/journal"),
                &member,
                slot,
                &route,
                None,
            )
            .unwrap();
        }

        let mirror = mirrored(&store);
        let state = mirror.read();
        let assignments = journal_assignments(&state, "/plume", &journal("a/journal"));
        let live = route_of(&assignments);
        assert_eq!(live.members, vec![pid("z#a"), pid("z#b")]);
        assert_eq!(live.primary, Some(0));

        assert_eq!(
            journal_spec(&state, "/plume", &journal("a/journal")).unwrap(),
            spec
        );
    }

    #[test]
    fn member_registration_and_lookup() {
        let store = Arc::new(MemStore::new());
        let lease = store.grant_lease();
        let spec = BrokerSpec {
            id: pid("z#a"),
            addr: "127.0.0.1:9000".to_string(),
        };
        register_member(store.as_ref(), "/plume", &spec, lease).unwrap();

        let mirror = mirrored(&store);
        assert_eq!(
            member_addr(&mirror.read(), "/plume", &pid("z#a")).as_deref(),
            Some("127.0.0.1:9000")
        );
    }

    #[test]
    fn journals_assigned_to_member() {
        let store = Arc::new(MemStore::new());
        let route = Route::default();
        for (j, m, s) in [
            ("a/one", "z#a", 0),
            ("a/two", "z#a", 1),
            ("a/two", "z#b", 0),
        ] {
            assign(
                store.as_ref(),
                "/plume",
                &journal(j),
                &pid(m),
                s,
                &route,
                None,
            )
            .unwrap();
        }
        let mirror = mirrored(&store);
        let state = mirror.read();
        assert_eq!(
            journals_assigned_to(&state, "/plume", &pid("z#a")),
            vec![journal("a/one"), journal("a/two")]
        );
        assert_eq!(
            journals_assigned_to(&state, "/plume", &pid("z#b")),
            vec![journal("a/two")]
        );
    }
}

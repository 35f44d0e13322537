//! Advertised-route reconciliation.
//!
//! Every assignment records the route its member advertises. The journal
//! is consistent when all of them advertise the live route; the append FSM
//! calls [`update_assignments`] to repair stale ones with a single
//! compare-and-swap, then re-resolves through the resulting revision.

use bytes::Bytes;

use crate::coord::store::{Compare, CoordError, CoordStore, Op, Revision, Txn};
use crate::coord::keys::Assignment;
use crate::core::Route;

use super::resolver::Resolution;

/// Whether every assignment advertises the live route.
pub fn route_matches_assignments(route: &Route, assignments: &[Assignment]) -> bool {
    assignments.iter().all(|a| a.advertised.equivalent(route))
}

/// CAS every stale assignment to advertise the resolved route.
///
/// Returns the revision to read through before re-resolving. A lost race
/// (concurrent assignment change) is not an error: the caller re-resolves
/// and observes whatever won.
pub fn update_assignments(
    resolution: &Resolution,
    store: &dyn CoordStore,
) -> Result<Revision, CoordError> {
    let route = &resolution.header.route;
    let value = serde_json::to_vec(route).expect("route serializes");

    let mut txn = Txn::default();
    for assignment in &resolution.assignments {
        if assignment.advertised.equivalent(route) {
            continue;
        }
        txn.compares.push(Compare::VersionEq {
            key: assignment.key.clone(),
            version: assignment.kv_version,
        });
        txn.success.push(Op::Put {
            key: assignment.key.clone(),
            value: Bytes::from(value.clone()),
            lease: assignment.lease,
        });
    }
    if txn.success.is_empty() {
        return Ok(resolution.header.revision);
    }

    let outcome = store.txn(txn)?;
    if !outcome.succeeded {
        tracing::debug!(
            journal = %resolution.assignments[0].journal,
            "assignment update lost a race; re-resolving"
        );
    }
    Ok(outcome.revision.max(resolution.header.revision))
}

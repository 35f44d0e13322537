//! Broker assembly: mirror, resolver, listeners, persistence, lifecycle.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::Config;
use crate::coord::{CoordStore, LeaseId, Mirror, keys};
use crate::core::{Limits, ProcessId, Route};
use crate::signal::{Signal, SignalRx, signal};
use crate::store::{FragmentStore, Persister};

use super::client::TcpConnector;
use super::pipeline::Connector;
use super::resolver::{ReplicaDeps, Resolver};
use super::server;

/// Shared state every RPC handler and FSM reads.
pub struct BrokerCore {
    pub local_id: ProcessId,
    pub prefix: String,
    pub resolver: Arc<Resolver>,
    pub coord: Arc<dyn CoordStore>,
    pub connector: Arc<dyn Connector>,
    pub stores: BTreeMap<String, Arc<dyn FragmentStore>>,
    pub limits: Limits,
    pub shutdown_rx: SignalRx,
}

impl BrokerCore {
    /// Advertised addresses for a route's non-local members, read from
    /// the mirror.
    pub fn member_addrs(&self, route: &Route) -> BTreeMap<ProcessId, String> {
        let state = self.resolver.mirror().read();
        route
            .members
            .iter()
            .filter(|member| **member != self.local_id)
            .filter_map(|member| {
                keys::member_addr(&state, &self.prefix, member).map(|addr| (member.clone(), addr))
            })
            .collect()
    }

    pub fn member_addr(&self, member: &ProcessId) -> Option<String> {
        let state = self.resolver.mirror().read();
        keys::member_addr(&state, &self.prefix, member)
    }
}

/// A running broker process.
pub struct Broker {
    core: Arc<BrokerCore>,
    local_addr: SocketAddr,
    lease: LeaseId,
    shutdown: Option<Signal>,
    joins: Vec<JoinHandle<()>>,
    persister: Option<Persister>,
}

impl Broker {
    /// Start a broker: mirror the keyspace, register the member under a
    /// lease, create any configured journals, and serve.
    pub fn start(
        config: &Config,
        coord: Arc<dyn CoordStore>,
        stores: BTreeMap<String, Arc<dyn FragmentStore>>,
    ) -> crate::Result<Self> {
        let local_id = ProcessId::new(&config.zone, &config.suffix)?;
        let limits = config.limits.clone();
        let (shutdown, shutdown_rx) = signal();

        let mirror = Mirror::new(config.coord_prefix.clone(), coord.cluster_id());
        let watch_join = mirror.bootstrap_and_watch(Arc::clone(&coord), shutdown_rx.clone());

        let persister = Persister::spawn(stores.clone(), limits.persist_retry_ms, shutdown_rx.clone());
        let resolver = Resolver::new(
            Arc::clone(&mirror),
            local_id.clone(),
            ReplicaDeps {
                persist_tx: persister.sender(),
                stores: stores.clone(),
            },
        );

        let listener = TcpListener::bind(&config.listen_addr)?;
        let local_addr = listener.local_addr()?;

        let lease = coord.grant_lease();
        keys::register_member(
            coord.as_ref(),
            &config.coord_prefix,
            &keys::BrokerSpec {
                id: local_id.clone(),
                addr: local_addr.to_string(),
            },
            lease,
        )
        .map_err(crate::Error::Coord)?;

        // Journals configured on this process are created (if absent) and
        // self-assigned at slot 0. Clustered deployments assign through
        // the coordination store instead.
        for spec in &config.journals {
            keys::create_journal(coord.as_ref(), &config.coord_prefix, spec)
                .map_err(crate::Error::Coord)?;
            let route = Route {
                members: vec![local_id.clone()],
                primary: Some(0),
            };
            keys::assign(
                coord.as_ref(),
                &config.coord_prefix,
                &spec.name,
                &local_id,
                0,
                &route,
                Some(lease),
            )
            .map_err(crate::Error::Coord)?;
        }

        let core = Arc::new(BrokerCore {
            local_id: local_id.clone(),
            prefix: config.coord_prefix.clone(),
            resolver,
            coord,
            connector: Arc::new(TcpConnector::new(limits.clone())),
            stores,
            limits,
            shutdown_rx: shutdown_rx.clone(),
        });

        let serve_join = server::serve(Arc::clone(&core), listener);
        tracing::info!(id = %local_id, addr = %local_addr, "broker serving");

        Ok(Self {
            core,
            local_addr,
            lease,
            shutdown: Some(shutdown),
            joins: vec![watch_join, serve_join],
            persister: Some(persister),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn core(&self) -> &Arc<BrokerCore> {
        &self.core
    }

    /// Graceful shutdown: surrender the lease (deassigning this member),
    /// stop local replicas, then stop serving and join workers.
    pub fn shutdown(mut self) {
        tracing::info!(id = %self.core.local_id, "broker shutting down");
        if let Err(err) = self.core.coord.revoke_lease(self.lease) {
            tracing::warn!("lease revocation failed: {err}");
        }
        self.core.resolver.stop_serving();
        if let Some(sig) = self.shutdown.take() {
            sig.fire();
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
        if let Some(persister) = self.persister.take() {
            persister.join();
        }
    }
}

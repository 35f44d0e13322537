//! In-process replicate peers for pipeline tests.
//!
//! Each simulated peer owns a persistent spool; connecting spawns a thread
//! that applies replicate requests against it, exactly as a remote broker's
//! replicate handler would. Peers can be seeded at an offset, forced to
//! answer WRONG_ROUTE, or made to fail sends.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam::channel::{Receiver, Sender, unbounded};

use crate::broker::pipeline::{Connector, PeerReceiver, PeerSender};
use crate::broker::proto::{ReplReq, ReplResp, Status};
use crate::broker::spool::{NullObserver, Spool};
use crate::core::{CompressionCodec, Fragment, JournalName, ProcessId};

pub struct LoopbackConnector {
    journal: JournalName,
    peers: Mutex<BTreeMap<ProcessId, PeerState>>,
}

struct PeerState {
    spool: Arc<Mutex<Spool>>,
    wrong_route_revision: Option<u64>,
    break_sends: bool,
}

impl LoopbackConnector {
    pub fn new(journal: JournalName) -> Self {
        Self {
            journal,
            peers: Mutex::new(BTreeMap::new()),
        }
    }

    fn peer_entry(&self, peer: &ProcessId) -> (Arc<Mutex<Spool>>, Option<u64>, bool) {
        let mut peers = self.peers.lock().unwrap();
        let state = peers.entry(peer.clone()).or_insert_with(|| PeerState {
            spool: Arc::new(Mutex::new(Spool::new(
                self.journal.clone(),
                CompressionCodec::None,
                Arc::new(NullObserver),
            ))),
            wrong_route_revision: None,
            break_sends: false,
        });
        (
            Arc::clone(&state.spool),
            state.wrong_route_revision,
            state.break_sends,
        )
    }

    /// Roll the peer's spool forward to `offset` before any connection.
    pub fn seed_peer(&self, peer: &ProcessId, offset: u64) {
        let (spool, _, _) = self.peer_entry(peer);
        let roll = Fragment::empty(self.journal.clone(), offset, CompressionCodec::None);
        let resp = spool.lock().unwrap().apply(&ReplReq {
            header: None,
            journal: None,
            proposal: Some(roll),
            acknowledge: true,
            content: bytes::Bytes::new(),
            content_delta: 0,
        });
        assert_eq!(resp.status, Status::Ok);
    }

    /// Make the peer answer every acknowledged request with WRONG_ROUTE.
    pub fn set_wrong_route(&self, peer: &ProcessId, revision: u64) {
        self.peer_entry(peer);
        self.peers
            .lock()
            .unwrap()
            .get_mut(peer)
            .unwrap()
            .wrong_route_revision = Some(revision);
    }

    /// Make sends to the peer fail with an io error.
    pub fn break_sends(&self, peer: &ProcessId) {
        self.peer_entry(peer);
        self.peers.lock().unwrap().get_mut(peer).unwrap().break_sends = true;
    }

    /// The peer's committed fragment and buffered delta.
    pub fn peer_state(&self, peer: &ProcessId) -> Option<(Fragment, u64)> {
        let peers = self.peers.lock().unwrap();
        let state = peers.get(peer)?;
        let spool = state.spool.lock().unwrap();
        Some((spool.fragment().clone(), spool.delta()))
    }
}

impl Connector for LoopbackConnector {
    fn connect(
        &self,
        peer: &ProcessId,
        _addr: &str,
    ) -> Result<(Box<dyn PeerSender>, Box<dyn PeerReceiver>), std::io::Error> {
        let (spool, wrong_route, break_sends) = self.peer_entry(peer);
        let (req_tx, req_rx) = unbounded::<ReplReq>();
        let (resp_tx, resp_rx) = unbounded::<ReplResp>();

        thread::spawn(move || run_peer(spool, req_rx, resp_tx, wrong_route));

        Ok((
            Box::new(LoopbackSender {
                tx: Some(req_tx),
                broken: break_sends,
            }),
            Box::new(LoopbackReceiver { rx: resp_rx }),
        ))
    }
}

fn run_peer(
    spool: Arc<Mutex<Spool>>,
    req_rx: Receiver<ReplReq>,
    resp_tx: Sender<ReplResp>,
    wrong_route: Option<u64>,
) {
    while let Ok(req) = req_rx.recv() {
        let resp = match wrong_route {
            Some(revision) => ReplResp {
                status: Status::WrongRoute,
                header: None,
                fragment: None,
                revision,
            },
            None => spool.lock().unwrap().apply(&req),
        };
        if req.acknowledge && resp_tx.send(resp).is_err() {
            return;
        }
    }
    // Dropping resp_tx is the peer's EOF.
}

struct LoopbackSender {
    tx: Option<Sender<ReplReq>>,
    broken: bool,
}

impl PeerSender for LoopbackSender {
    fn send(&mut self, req: &ReplReq) -> Result<(), std::io::Error> {
        if self.broken {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "loopback send broken",
            ));
        }
        match &self.tx {
            Some(tx) => tx.send(req.clone()).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "loopback peer gone")
            }),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "send after close",
            )),
        }
    }

    fn close(&mut self) {
        self.tx.take();
    }
}

struct LoopbackReceiver {
    rx: Receiver<ReplResp>,
}

impl PeerReceiver for LoopbackReceiver {
    fn recv(&mut self) -> Result<Option<ReplResp>, std::io::Error> {
        match self.rx.recv() {
            Ok(resp) => Ok(Some(resp)),
            Err(_) => Ok(None),
        }
    }
}

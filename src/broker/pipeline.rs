//! The replication pipeline: an open, ordered, multi-peer session.
//!
//! The send side (spool plus one stream per peer) and the receive side
//! (one response stream per peer) are serialized independently. Appenders
//! hand the send side around through the replica's pipeline mailbox; the
//! receive side moves along a barrier chain, so acknowledgements are
//! consumed in exactly the order proposals were scattered.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use thiserror::Error;

use crate::core::{Fragment, ProcessId, Route};
use crate::coord::Revision;

use super::proto::{Header, ReplReq, ReplResp, Status};
use super::spool::Spool;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("peer {peer}: {reason}")]
    Peer { peer: ProcessId, reason: String },

    #[error("peer {peer} responded {status}")]
    PeerStatus { peer: ProcessId, status: Status },

    #[error("peer {peer} closed its stream mid-session")]
    UnexpectedEof { peer: ProcessId },

    #[error("no advertised address for peer {peer}")]
    NoPeerAddress { peer: ProcessId },
}

/// The send half of one peer's replicate stream.
pub trait PeerSender: Send {
    fn send(&mut self, req: &ReplReq) -> Result<(), std::io::Error>;
    /// Half-close, so the peer observes EOF after draining.
    fn close(&mut self);
}

/// The receive half of one peer's replicate stream. `Ok(None)` is EOF.
pub trait PeerReceiver: Send {
    fn recv(&mut self) -> Result<Option<ReplResp>, std::io::Error>;
}

/// Opens replicate streams to peer brokers.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        peer: &ProcessId,
        addr: &str,
    ) -> Result<(Box<dyn PeerSender>, Box<dyn PeerReceiver>), std::io::Error>;
}

enum PeerSend {
    /// The primary's own spool, virtual peer zero.
    Local { resp_tx: Sender<ReplResp> },
    Remote {
        peer: ProcessId,
        tx: Box<dyn PeerSender>,
        broken: bool,
    },
}

enum PeerRecv {
    Local { resp_rx: Receiver<ReplResp> },
    Remote {
        peer: ProcessId,
        rx: Box<dyn PeerReceiver>,
        eof: bool,
    },
}

struct SendSide {
    spool: Option<Spool>,
    peers: Vec<PeerSend>,
    err: Option<PipelineError>,
}

struct RecvSide {
    peers: Vec<PeerRecv>,
    err: Option<PipelineError>,
}

pub struct Pipeline {
    header: Header,
    send: Mutex<SendSide>,
    recv: Mutex<RecvSide>,
    barrier_tail: Mutex<Receiver<()>>,
    spool_return: Sender<Spool>,
}

impl Pipeline {
    /// Build a pipeline over `header.route`, opening a replicate stream to
    /// every non-local member. On failure the spool is returned to its
    /// mailbox before the error surfaces.
    pub fn new(
        header: Header,
        spool: Spool,
        spool_return: Sender<Spool>,
        local_id: &ProcessId,
        connector: &dyn Connector,
        addrs: &BTreeMap<ProcessId, String>,
    ) -> Result<Arc<Self>, PipelineError> {
        let mut send_peers = Vec::with_capacity(header.route.members.len());
        let mut recv_peers = Vec::with_capacity(header.route.members.len());

        for member in &header.route.members {
            if member == local_id {
                let (resp_tx, resp_rx) = unbounded();
                send_peers.push(PeerSend::Local { resp_tx });
                recv_peers.push(PeerRecv::Local { resp_rx });
                continue;
            }
            let result = addrs
                .get(member)
                .ok_or_else(|| PipelineError::NoPeerAddress {
                    peer: member.clone(),
                })
                .and_then(|addr| {
                    connector
                        .connect(member, addr)
                        .map_err(|err| PipelineError::Peer {
                            peer: member.clone(),
                            reason: err.to_string(),
                        })
                });
            match result {
                Ok((tx, rx)) => {
                    send_peers.push(PeerSend::Remote {
                        peer: member.clone(),
                        tx,
                        broken: false,
                    });
                    recv_peers.push(PeerRecv::Remote {
                        peer: member.clone(),
                        rx,
                        eof: false,
                    });
                }
                Err(err) => {
                    for peer in &mut send_peers {
                        if let PeerSend::Remote { tx, .. } = peer {
                            tx.close();
                        }
                    }
                    let _ = spool_return.send(spool);
                    return Err(err);
                }
            }
        }

        // The chain starts open: a receiver whose sender is already gone.
        let (tail_tx, tail_rx) = bounded(0);
        drop(tail_tx);

        Ok(Arc::new(Self {
            header,
            send: Mutex::new(SendSide {
                spool: Some(spool),
                peers: send_peers,
                err: None,
            }),
            recv: Mutex::new(RecvSide {
                peers: recv_peers,
                err: None,
            }),
            barrier_tail: Mutex::new(tail_rx),
            spool_return,
        }))
    }

    pub fn route(&self) -> &Route {
        &self.header.route
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Read the spool under the send lock. Panics if called after the
    /// spool was released by shutdown.
    pub fn with_spool<R>(&self, f: impl FnOnce(&Spool) -> R) -> R {
        let send = self.send.lock().expect("send side poisoned");
        f(send.spool.as_ref().expect("pipeline spool released"))
    }

    /// Fan `req` out to every peer and apply it to the local spool. Stream
    /// errors latch into `send_err`; healthy peers keep receiving.
    pub fn scatter(&self, req: &ReplReq) {
        let mut send = self.send.lock().expect("send side poisoned");
        let SendSide { spool, peers, err } = &mut *send;
        for peer in peers.iter_mut() {
            match peer {
                PeerSend::Local { resp_tx } => {
                    let resp = spool
                        .as_mut()
                        .expect("pipeline spool released")
                        .apply(req);
                    if req.acknowledge {
                        let _ = resp_tx.send(resp);
                    }
                }
                PeerSend::Remote { peer, tx, broken } => {
                    if *broken {
                        continue;
                    }
                    if let Err(send_err) = tx.send(req) {
                        *broken = true;
                        if err.is_none() {
                            *err = Some(PipelineError::Peer {
                                peer: peer.clone(),
                                reason: send_err.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    pub fn send_err(&self) -> Option<PipelineError> {
        self.send.lock().expect("send side poisoned").err.clone()
    }

    pub fn recv_err(&self) -> Option<PipelineError> {
        self.recv.lock().expect("recv side poisoned").err.clone()
    }

    /// Half-close every peer stream.
    pub fn close_send(&self) {
        let mut send = self.send.lock().expect("send side poisoned");
        for peer in &mut send.peers {
            if let PeerSend::Remote { tx, .. } = peer {
                tx.close();
            }
        }
    }

    /// Gather one synchronization response per peer.
    ///
    /// Returns `(roll_to_offset, read_through_revision)`: the offset every
    /// spool must roll to before the pipeline converges (0 when aligned),
    /// and the revision to re-resolve through when a peer saw a newer
    /// route (0 when none did).
    pub fn gather_sync(&self, proposal: &Fragment) -> (u64, Revision) {
        let mut recv = self.recv.lock().expect("recv side poisoned");
        let mut roll_to = 0u64;
        let mut read_through: Revision = 0;

        let RecvSide { peers, err } = &mut *recv;
        for peer in peers.iter_mut() {
            match recv_one(peer) {
                Ok(resp) => match resp.status {
                    Status::Ok => {}
                    Status::FragmentMismatch => {
                        let counter_end = resp
                            .fragment
                            .as_ref()
                            .map(|f| f.end)
                            .unwrap_or(proposal.end);
                        // Re-syncing at an offset at or past every spool's
                        // extent lets all peers roll forward cleanly.
                        roll_to = roll_to.max(counter_end).max(proposal.end);
                    }
                    Status::WrongRoute => {
                        let revision = resp
                            .header
                            .as_ref()
                            .map(|h| h.revision)
                            .unwrap_or(0)
                            .max(resp.revision);
                        read_through = read_through.max(revision);
                    }
                    status => {
                        if err.is_none() {
                            *err = Some(PipelineError::PeerStatus {
                                peer: peer_id(peer),
                                status,
                            });
                        }
                    }
                },
                Err(recv_err) => {
                    if err.is_none() {
                        *err = Some(recv_err);
                    }
                }
            }
        }
        (roll_to, read_through)
    }

    /// Consume one acknowledgement per peer; any non-OK latches.
    pub fn gather_ok(&self) {
        let mut recv = self.recv.lock().expect("recv side poisoned");
        let RecvSide { peers, err } = &mut *recv;
        for peer in peers.iter_mut() {
            match recv_one(peer) {
                Ok(resp) if resp.status == Status::Ok => {}
                Ok(resp) => {
                    if err.is_none() {
                        *err = Some(PipelineError::PeerStatus {
                            peer: peer_id(peer),
                            status: resp.status,
                        });
                    }
                }
                Err(recv_err) => {
                    if err.is_none() {
                        *err = Some(recv_err);
                    }
                }
            }
        }
    }

    /// After the send side has been closed, drain every peer to EOF so
    /// stream resources are not leaked.
    pub fn gather_eof(&self) {
        let mut recv = self.recv.lock().expect("recv side poisoned");
        let RecvSide { peers, err } = &mut *recv;
        for peer in peers.iter_mut() {
            match peer {
                PeerRecv::Local { .. } => {}
                PeerRecv::Remote { peer, rx, eof } => {
                    while !*eof {
                        match rx.recv() {
                            Ok(None) => *eof = true,
                            Ok(Some(_)) => {
                                if err.is_none() {
                                    *err = Some(PipelineError::Peer {
                                        peer: peer.clone(),
                                        reason: "response after close".to_string(),
                                    });
                                }
                            }
                            Err(_) => *eof = true,
                        }
                    }
                }
            }
        }
    }

    /// Claim a slot in the receive-barrier chain.
    ///
    /// `wait_for` becomes ready when the previous holder releases; dropping
    /// `close_after` releases the next. Between those two points the caller
    /// exclusively owns the receive side.
    pub fn barrier(&self) -> (Receiver<()>, Sender<()>) {
        let (tx, next_rx) = bounded(0);
        let mut tail = self.barrier_tail.lock().expect("barrier poisoned");
        let wait_for = std::mem::replace(&mut *tail, next_rx);
        (wait_for, tx)
    }

    /// Tear the pipeline down: close sends, release the spool back to its
    /// mailbox, wait out pipelined receivers, and drain peers to EOF.
    pub fn shutdown(self: Arc<Self>, expect_errors: bool) {
        self.close_send();
        if let Some(spool) = self
            .send
            .lock()
            .expect("send side poisoned")
            .spool
            .take()
        {
            let _ = self.spool_return.send(spool);
        }

        let (wait_for, close_after) = self.barrier();
        let _ = wait_for.recv();
        self.gather_eof();
        drop(close_after);

        if !expect_errors
            && let Some(err) = self.recv_err()
        {
            tracing::warn!(route = %self.header.route, "pipeline shutdown: {err}");
        }
    }
}

fn peer_id(peer: &PeerRecv) -> ProcessId {
    match peer {
        PeerRecv::Local { .. } => ProcessId::new("local", "spool").expect("static id"),
        PeerRecv::Remote { peer, .. } => peer.clone(),
    }
}

fn recv_one(peer: &mut PeerRecv) -> Result<ReplResp, PipelineError> {
    match peer {
        PeerRecv::Local { resp_rx } => resp_rx.recv().map_err(|_| PipelineError::UnexpectedEof {
            peer: ProcessId::new("local", "spool").expect("static id"),
        }),
        PeerRecv::Remote { peer, rx, eof } => match rx.recv() {
            Ok(Some(resp)) => Ok(resp),
            Ok(None) => {
                *eof = true;
                Err(PipelineError::UnexpectedEof { peer: peer.clone() })
            }
            Err(err) => Err(PipelineError::Peer {
                peer: peer.clone(),
                reason: err.to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompressionCodec, JournalName};
    use crate::test_support::LoopbackConnector;
    use bytes::Bytes;

    fn journal() -> JournalName {
        JournalName::parse("a/journal").unwrap()
    }

    fn pid(raw: &str) -> ProcessId {
        ProcessId::parse(raw).unwrap()
    }

    fn header(members: &[&str]) -> Header {
        Header {
            process_id: pid(members[0]),
            route: Route {
                members: members.iter().map(|m| pid(m)).collect(),
                primary: Some(0),
            },
            revision: 1,
            cluster_id: 1,
        }
    }

    fn build(
        connector: &LoopbackConnector,
        members: &[&str],
    ) -> (Arc<Pipeline>, Receiver<Spool>) {
        let (spool_tx, spool_rx) = bounded(1);
        let spool = Spool::new(
            journal(),
            CompressionCodec::None,
            Arc::new(crate::broker::spool::NullObserver),
        );
        let addrs: BTreeMap<ProcessId, String> = members
            .iter()
            .map(|m| (pid(m), m.to_string()))
            .collect();
        let pipeline = Pipeline::new(
            header(members),
            spool,
            spool_tx,
            &pid(members[0]),
            connector,
            &addrs,
        )
        .unwrap();
        (pipeline, spool_rx)
    }

    fn content_req(content: &[u8], delta: u64) -> ReplReq {
        ReplReq {
            header: None,
            journal: None,
            proposal: None,
            acknowledge: false,
            content: Bytes::copy_from_slice(content),
            content_delta: delta,
        }
    }

    fn proposal_req(proposal: Fragment) -> ReplReq {
        ReplReq {
            header: None,
            journal: None,
            proposal: Some(proposal),
            acknowledge: true,
            content: Bytes::new(),
            content_delta: 0,
        }
    }

    #[test]
    fn scatter_commit_gathers_ok_from_all_peers() {
        let connector = LoopbackConnector::new(journal());
        let (pipeline, _spool_rx) = build(&connector, &["z#primary", "z#peer"]);

        // Sync at zero.
        let sync = pipeline.with_spool(|s| s.next());
        pipeline.scatter(&proposal_req(sync.clone()));
        assert_eq!(pipeline.gather_sync(&sync), (0, 0));

        pipeline.scatter(&content_req(b"foobarbaz", 0));
        let commit = pipeline.with_spool(|s| s.next());
        assert_eq!(commit.end, 9);
        pipeline.scatter(&proposal_req(commit));
        pipeline.gather_ok();
        assert_eq!(pipeline.recv_err(), None);
        assert_eq!(pipeline.send_err(), None);

        assert_eq!(
            connector.peer_state(&pid("z#peer")).unwrap().0.end,
            9,
            "peer spool converged on the commit"
        );
    }

    #[test]
    fn gather_sync_rolls_to_furthest_peer() {
        let connector = LoopbackConnector::new(journal());
        connector.seed_peer(&pid("z#peer"), 50);
        let (pipeline, _spool_rx) = build(&connector, &["z#primary", "z#peer"]);

        let sync = pipeline.with_spool(|s| s.next());
        pipeline.scatter(&proposal_req(sync.clone()));
        let (roll_to, read_through) = pipeline.gather_sync(&sync);
        assert_eq!((roll_to, read_through), (50, 0));

        // Second round: an empty proposal at the roll target converges.
        let next = Fragment::empty(journal(), roll_to, CompressionCodec::None);
        pipeline.scatter(&proposal_req(next.clone()));
        assert_eq!(pipeline.gather_sync(&next), (0, 0));
        assert_eq!(pipeline.with_spool(|s| s.fragment().begin), 50);
    }

    #[test]
    fn gather_sync_reports_wrong_route_revision() {
        let connector = LoopbackConnector::new(journal());
        connector.set_wrong_route(&pid("z#peer"), 77);
        let (pipeline, _spool_rx) = build(&connector, &["z#primary", "z#peer"]);

        let sync = pipeline.with_spool(|s| s.next());
        pipeline.scatter(&proposal_req(sync.clone()));
        let (roll_to, read_through) = pipeline.gather_sync(&sync);
        assert_eq!((roll_to, read_through), (0, 77));
    }

    #[test]
    fn barrier_chain_orders_receivers() {
        let connector = LoopbackConnector::new(journal());
        let (pipeline, _spool_rx) = build(&connector, &["z#primary"]);

        let (first_wait, first_release) = pipeline.barrier();
        let (second_wait, second_release) = pipeline.barrier();

        // The chain head is already open.
        assert!(first_wait.try_recv().is_err());
        // The second waiter is blocked until the first releases.
        assert!(matches!(
            second_wait.try_recv(),
            Err(crossbeam::channel::TryRecvError::Empty)
        ));
        drop(first_release);
        assert!(matches!(
            second_wait.try_recv(),
            Err(crossbeam::channel::TryRecvError::Disconnected)
        ));
        drop(second_release);
    }

    #[test]
    fn send_error_latches_and_peers_drain() {
        let connector = LoopbackConnector::new(journal());
        connector.break_sends(&pid("z#bad"));
        let (pipeline, _spool_rx) = build(&connector, &["z#primary", "z#bad", "z#peer"]);

        pipeline.scatter(&content_req(b"data", 0));
        assert!(pipeline.send_err().is_some());

        // The rollback proposal still reaches the healthy peer.
        let rollback = pipeline.with_spool(|s| s.fragment().clone());
        pipeline.scatter(&proposal_req(rollback));
        pipeline.close_send();
        pipeline.gather_eof();
    }

    #[test]
    fn shutdown_returns_spool() {
        let connector = LoopbackConnector::new(journal());
        let (pipeline, spool_rx) = build(&connector, &["z#primary", "z#peer"]);
        assert!(spool_rx.try_recv().is_err());
        pipeline.shutdown(false);
        let spool = spool_rx.try_recv().expect("spool returned on shutdown");
        assert_eq!(spool.end(), 0);
    }
}

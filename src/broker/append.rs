//! The append state machine.
//!
//! One FSM drives one client append from resolution through commit or
//! rollback. It may back-track — re-resolving at later revisions,
//! re-syncing the pipeline at peer-proposed offsets — as it converges on
//! the distributed consistency an append requires. Once streaming, chunks
//! and timer ticks are consumed from channels; two elapsed chunk budgets
//! without input abort the append with a rollback.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::Receiver;
use thiserror::Error;

use crate::coord::Revision;
use crate::core::{Fragment, Summer};
use crate::signal::{Cancelled, SignalRx};

use super::pipeline::{Pipeline, PipelineError};
use super::proto::{AppendChunk, AppendReq, Header, ReplReq, Status};
use super::reconcile;
use super::resolver::{ResolveArgs, ResolveError, Resolution};
use super::service::BrokerCore;
use super::spool::next_proposal;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AppendState {
    Resolve,
    AcquirePipeline,
    StartPipeline,
    SendPipelineSync,
    RecvPipelineSync,
    UpdateAssignments,
    AwaitDesiredReplicas,
    ValidateOffset,
    StreamContent,
    ReadAcknowledgements,
    Error,
    Proxy,
    Finished,
}

#[derive(Debug, Error)]
pub enum AppendError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("resolve: {0}")]
    Resolve(#[from] ResolveError),

    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("coordination store: {0}")]
    Coord(#[from] crate::coord::CoordError),

    #[error("expected EOF after empty content chunk")]
    ExpectedEof,

    #[error("stream closed before a commit chunk")]
    UnexpectedEof,

    #[error("append chunk deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("append stream: {0}")]
    Stream(String),
}

/// One event from the client's chunk stream.
#[derive(Debug)]
pub enum ChunkEvent {
    Chunk(AppendChunk),
    Eof,
    Deadline,
    Err(String),
}

/// Terminal result of one append.
#[derive(Debug)]
pub enum AppendOutcome {
    /// Respond OK with the commit covering the client's content.
    Finished {
        header: Header,
        commit: Fragment,
        registered_length: u64,
    },
    /// Respond with a refusal status.
    Refused { status: Status, header: Header },
    /// Abort the stream.
    Failed(AppendError),
    /// Forward the append to the responsible broker.
    Proxy { header: Header },
}

pub struct AppendFsm<'a> {
    core: &'a BrokerCore,
    cancel: &'a SignalRx,
    req: AppendReq,

    state: AppendState,
    resolved: Option<Resolution>,
    pln: Option<Arc<Pipeline>>,
    /// If the pipeline slot is held, the mailbox it must be returned to.
    pln_return: Option<crossbeam::channel::Sender<Option<Arc<Pipeline>>>>,
    read_through: Revision,
    roll_to: u64,
    sync_proposal: Option<Fragment>,
    client_commit: bool,
    client_fragment: Option<Fragment>,
    client_summer: Summer,
    status: Status,
    err: Option<AppendError>,
}

impl<'a> AppendFsm<'a> {
    pub fn new(core: &'a BrokerCore, req: AppendReq, cancel: &'a SignalRx) -> Self {
        Self {
            core,
            cancel,
            req,
            state: AppendState::Resolve,
            resolved: None,
            pln: None,
            pln_return: None,
            read_through: 0,
            roll_to: 0,
            sync_proposal: None,
            client_commit: false,
            client_fragment: None,
            client_summer: Summer::new(),
            status: Status::Ok,
            err: None,
        }
    }

    /// Run to a terminal state, consuming `chunks` once streaming begins.
    pub fn run(mut self, chunks: &Receiver<ChunkEvent>) -> AppendOutcome {
        if self.run_to_streaming() {
            let ticker = crossbeam::channel::tick(Duration::from_millis(
                self.core.limits.append_chunk_timeout_ms,
            ));
            let mut saw_chunk = false;
            while self.state == AppendState::StreamContent {
                crossbeam::select! {
                    recv(chunks) -> event => {
                        match event {
                            Ok(event) => self.on_stream_content(event),
                            // The pump thread died; treat as a broken stream.
                            Err(_) => self.on_stream_content(ChunkEvent::Err(
                                "chunk stream disconnected".to_string(),
                            )),
                        }
                        saw_chunk = true;
                    }
                    recv(ticker) -> _ => {
                        if !saw_chunk {
                            self.on_stream_content(ChunkEvent::Deadline);
                        }
                        saw_chunk = false;
                    }
                }
            }
            self.on_read_acknowledgements();
        }
        self.return_pipeline();
        self.outcome()
    }

    /// Evaluate states until streaming (true) or a terminal state (false).
    fn run_to_streaming(&mut self) -> bool {
        loop {
            match self.state {
                AppendState::Resolve => self.on_resolve(),
                AppendState::AcquirePipeline => self.on_acquire_pipeline(),
                AppendState::StartPipeline => self.on_start_pipeline(),
                AppendState::SendPipelineSync => self.on_send_pipeline_sync(),
                AppendState::RecvPipelineSync => self.on_recv_pipeline_sync(),
                AppendState::UpdateAssignments => self.on_update_assignments(),
                AppendState::AwaitDesiredReplicas => self.on_await_desired_replicas(),
                AppendState::ValidateOffset => self.on_validate_offset(),
                AppendState::StreamContent => return true,
                AppendState::Error | AppendState::Proxy | AppendState::Finished => return false,
                AppendState::ReadAcknowledgements => {
                    panic!("unexpected appendFSM state {:?}", self.state)
                }
            }
        }
    }

    /// Release a held pipeline slot, if any. A live pipeline goes back for
    /// reuse; a torn-down one leaves the sentinel so the next appender
    /// rebuilds.
    fn return_pipeline(&mut self) {
        if let Some(tx) = self.pln_return.take() {
            let _ = tx.send(self.pln.take());
        }
    }

    fn must_state(&self, expect: AppendState) {
        if self.state != expect {
            panic!(
                "unexpected appendFSM state: expect {expect:?}, actual {:?}",
                self.state
            );
        }
    }

    fn on_resolve(&mut self) {
        self.must_state(AppendState::Resolve);

        let result = self.core.resolver.resolve(ResolveArgs {
            journal: self.req.journal.clone(),
            require_primary: true,
            may_proxy: !self.req.do_not_proxy,
            min_revision: self.read_through,
            proxy_header: self.req.header.as_ref(),
            cancel: self.cancel,
        });

        match result {
            Err(err) => {
                self.err = Some(err.into());
                self.state = AppendState::Error;
            }
            Ok(res) => {
                if res.status != Status::Ok {
                    self.status = res.status;
                    self.resolved = Some(res);
                    self.state = AppendState::Error;
                } else if res.header.process_id != res.local_id {
                    // No longer (or never) primary: release any held
                    // pipeline and decide whether to proxy.
                    self.resolved = Some(res);
                    self.return_pipeline();
                    self.state = AppendState::AwaitDesiredReplicas;
                } else if self.pln_return.is_some() {
                    self.resolved = Some(res);
                    self.state = AppendState::StartPipeline;
                } else {
                    self.resolved = Some(res);
                    self.state = AppendState::AcquirePipeline;
                }
            }
        }
    }

    fn on_acquire_pipeline(&mut self) {
        self.must_state(AppendState::AcquirePipeline);

        let res = self.resolved.as_ref().expect("resolved before acquire");
        let replica = res.replica.as_ref().expect("local primary has a replica");
        let invalidate_rx = res.invalidate_rx.clone();
        let shutdown_rx = replica.shutdown_rx().clone();

        crossbeam::select! {
            recv(replica.pipeline_slot()) -> slot => {
                match slot {
                    Ok(pln) => {
                        self.pln = pln;
                        self.pln_return = Some(replica.pipeline_return_tx());
                        // Post-check: the slot and an aborting signal may
                        // have become selectable at the same moment.
                        if self.cancel.is_fired() {
                            self.err = Some(Cancelled.into());
                            self.state = AppendState::Error;
                        } else if invalidate_rx.is_fired() {
                            self.state = AppendState::Resolve;
                        } else {
                            self.state = AppendState::StartPipeline;
                        }
                    }
                    Err(_) => {
                        self.err = Some(Cancelled.into());
                        self.state = AppendState::Error;
                    }
                }
            }
            recv(self.cancel.receiver()) -> _ => {
                self.err = Some(Cancelled.into());
                self.state = AppendState::Error;
            }
            recv(shutdown_rx.receiver()) -> _ => {
                self.err = Some(Cancelled.into());
                self.state = AppendState::Error;
            }
            recv(invalidate_rx.receiver()) -> _ => {
                self.state = AppendState::Resolve;
            }
        }
    }

    fn on_start_pipeline(&mut self) {
        self.must_state(AppendState::StartPipeline);

        let res = self.resolved.as_ref().expect("resolved before start");
        // An extant pipeline at our resolved route is, by construction,
        // already synchronized.
        if let Some(pln) = &self.pln {
            if pln.route().equivalent(&res.header.route) {
                self.state = AppendState::UpdateAssignments;
                return;
            }
            let old = self.pln.take().expect("checked above");
            thread::spawn(move || old.shutdown(false));
        }

        let replica = res.replica.as_ref().expect("local primary has a replica");
        let invalidate_rx = res.invalidate_rx.clone();
        let shutdown_rx = replica.shutdown_rx().clone();

        let spool = crossbeam::select! {
            recv(replica.spool_slot()) -> spool => match spool {
                Ok(spool) => spool,
                Err(_) => {
                    self.err = Some(Cancelled.into());
                    self.state = AppendState::Error;
                    return;
                }
            },
            recv(self.cancel.receiver()) -> _ => {
                self.err = Some(Cancelled.into());
                self.state = AppendState::Error;
                return;
            }
            recv(shutdown_rx.receiver()) -> _ => {
                self.err = Some(Cancelled.into());
                self.state = AppendState::Error;
                return;
            }
            recv(invalidate_rx.receiver()) -> _ => {
                self.state = AppendState::Resolve;
                return;
            }
        };

        // The pipeline is bound to the replica's lifetime, not this
        // request's: it outlives us through the mailbox.
        let addrs = self.core.member_addrs(&res.header.route);
        match Pipeline::new(
            res.header.clone(),
            spool,
            replica.spool_return_tx(),
            &res.local_id,
            self.core.connector.as_ref(),
            &addrs,
        ) {
            Ok(pln) => {
                self.pln = Some(pln);
                self.roll_to = 0;
                self.state = AppendState::SendPipelineSync;
            }
            Err(err) => {
                self.err = Some(err.into());
                self.state = AppendState::Error;
            }
        }
    }

    fn on_send_pipeline_sync(&mut self) {
        self.must_state(AppendState::SendPipelineSync);

        let res = self.resolved.as_ref().expect("resolved before sync");
        let pln = self.pln.as_ref().expect("pipeline held");
        let params = res.fragment_params();

        let proposal = pln.with_spool(|spool| {
            next_proposal(
                spool,
                self.roll_to,
                params.max_length_bytes,
                params.flush_age_ms,
            )
        });

        // The first sync of a pipeline introduces the stream: it carries
        // the routing header and journal.
        let first_sync = self.roll_to == 0;
        let req = ReplReq {
            header: first_sync.then(|| pln.header().clone()),
            journal: first_sync.then(|| self.req.journal.clone()),
            proposal: Some(proposal.clone()),
            acknowledge: true,
            content: Bytes::new(),
            content_delta: 0,
        };
        pln.scatter(&req);
        self.sync_proposal = Some(proposal);
        self.state = AppendState::RecvPipelineSync;
    }

    fn on_recv_pipeline_sync(&mut self) {
        self.must_state(AppendState::RecvPipelineSync);

        let pln = self.pln.as_ref().expect("pipeline held").clone();
        let proposal = self.sync_proposal.take().expect("sync sent");
        let (roll_to, read_through) = pln.gather_sync(&proposal);

        if let Some(err) = pln.recv_err().or_else(|| pln.send_err()) {
            self.pln = None;
            thread::spawn(move || pln.shutdown(true));
            self.err = Some(err.into());
            self.state = AppendState::Error;
            return;
        }

        if roll_to != 0 {
            if pln.with_spool(|s| roll_to < s.fragment().begin) {
                panic!("pipeline sync would regress the committed offset");
            }
            self.roll_to = roll_to;
            self.state = AppendState::SendPipelineSync;
        } else if read_through != 0 {
            // A peer resolved the journal at a later revision; catch up.
            self.pln = None;
            thread::spawn(move || pln.shutdown(false));
            self.read_through = read_through;
            self.state = AppendState::Resolve;
        } else {
            self.state = AppendState::UpdateAssignments;
        }
    }

    fn on_update_assignments(&mut self) {
        self.must_state(AppendState::UpdateAssignments);

        let res = self.resolved.as_ref().expect("resolved before update");
        if reconcile::route_matches_assignments(&res.header.route, &res.assignments) {
            self.state = AppendState::AwaitDesiredReplicas;
            return;
        }

        match reconcile::update_assignments(res, self.core.coord.as_ref()) {
            Ok(revision) => {
                self.read_through = revision;
                self.state = AppendState::Resolve;
            }
            Err(err) => {
                self.err = Some(err.into());
                self.state = AppendState::Error;
            }
        }
    }

    fn on_await_desired_replicas(&mut self) {
        self.must_state(AppendState::AwaitDesiredReplicas);

        let res = self.resolved.as_ref().expect("resolved before await");
        let n = res.header.route.members.len();
        let d = res.spec.as_ref().map(|s| s.replication).unwrap_or(1) as usize;

        if n > d {
            // The allocator has over-subscribed the journal ahead of
            // removing members; wait for it rather than writing wide.
            self.read_through = res.header.revision + 1;
            self.state = AppendState::Resolve;
        } else if n < d {
            self.status = Status::InsufficientJournalBrokers;
            self.state = AppendState::Error;
        } else if res.header.process_id != res.local_id {
            self.state = AppendState::Proxy;
        } else {
            self.state = AppendState::ValidateOffset;
        }
    }

    fn on_validate_offset(&mut self) {
        self.must_state(AppendState::ValidateOffset);

        let res = self.resolved.as_ref().expect("resolved before validate");
        let replica = res.replica.as_ref().expect("local primary has a replica");

        // Appends must land at the furthest known extent. If consistency
        // was lost, a larger offset can exist in the fragment index; the
        // operator recovers by appending at an explicit offset.
        if let Err(err) = replica.index.wait_for_first_remote_refresh(self.cancel) {
            self.err = Some(err.into());
            self.state = AppendState::Error;
            return;
        }

        let pln = self.pln.as_ref().expect("pipeline held");
        let spool_end = pln.with_spool(|s| s.end());
        let max_offset = spool_end.max(replica.index.end_offset());
        let may_write = res
            .spec
            .as_ref()
            .map(|s| s.access.may_write())
            .unwrap_or(false);

        if spool_end != max_offset && self.req.offset == 0 && may_write {
            self.status = Status::IndexHasGreaterOffset;
            self.state = AppendState::Error;
        } else if self.req.offset != 0 && self.req.offset != max_offset {
            self.status = Status::WrongAppendOffset;
            self.state = AppendState::Error;
        } else if self.req.offset != 0 && spool_end != max_offset {
            // Re-sync the pipeline at the requested offset.
            self.roll_to = max_offset;
            self.state = AppendState::SendPipelineSync;
        } else {
            self.state = AppendState::StreamContent;
        }
    }

    fn on_stream_content(&mut self, event: ChunkEvent) {
        self.must_state(AppendState::StreamContent);

        let res = self.resolved.as_ref().expect("resolved before streaming");
        let pln = self.pln.as_ref().expect("pipeline held").clone();

        if self.client_fragment.is_none() {
            // First call: potentially roll the fragment forward ahead of
            // this append. The pipeline is synchronized, so this always
            // succeeds and no acknowledgement is requested.
            let params = res.fragment_params();
            let proposal = pln.with_spool(|spool| {
                next_proposal(spool, 0, params.max_length_bytes, params.flush_age_ms)
            });
            if !pln.with_spool(|s| proposal.equivalent(s.fragment())) {
                pln.scatter(&ReplReq {
                    header: None,
                    journal: None,
                    proposal: Some(proposal),
                    acknowledge: false,
                    content: Bytes::new(),
                    content_delta: 0,
                });
            }
            let (journal, begin, codec) = pln.with_spool(|s| {
                let f = s.fragment();
                (f.journal.clone(), f.end, f.codec)
            });
            self.client_fragment = Some(Fragment::empty(journal, begin, codec));
            self.client_summer = Summer::new();
        }

        let may_write = res
            .spec
            .as_ref()
            .map(|s| s.access.may_write())
            .unwrap_or(false);
        let mut stream_err: Option<AppendError> = None;
        let mut reached_eof = false;

        match event {
            ChunkEvent::Deadline => {
                stream_err = Some(AppendError::DeadlineExceeded);
            }
            ChunkEvent::Err(reason) => {
                stream_err = Some(AppendError::Stream(reason));
            }
            ChunkEvent::Eof => {
                if self.client_commit {
                    reached_eof = true;
                } else {
                    // EOF without the empty commit chunk is a roll-back.
                    stream_err = Some(AppendError::UnexpectedEof);
                }
            }
            ChunkEvent::Chunk(chunk) => {
                if self.client_commit {
                    stream_err = Some(AppendError::ExpectedEof);
                } else if chunk.content.is_empty() {
                    // Empty chunk: an EOF follows, at which point we commit.
                    self.client_commit = true;
                    return;
                } else if !may_write {
                    self.status = Status::NotAllowed;
                } else if chunk.content.len() > self.core.limits.max_append_chunk_bytes {
                    stream_err = Some(AppendError::InvalidChunk(format!(
                        "chunk of {} bytes exceeds limit",
                        chunk.content.len()
                    )));
                } else {
                    let client_fragment =
                        self.client_fragment.as_mut().expect("initialized above");
                    pln.scatter(&ReplReq {
                        header: None,
                        journal: None,
                        proposal: None,
                        acknowledge: false,
                        content: chunk.content.clone(),
                        content_delta: client_fragment.len(),
                    });
                    self.client_summer.update(&chunk.content);
                    client_fragment.end += chunk.content.len() as u64;

                    if pln.send_err().is_none() {
                        return;
                    }
                }
            }
        }

        // End of input, an error, or a refused write: finalize the client
        // fragment and scatter the terminal proposal.
        let client_fragment = self.client_fragment.as_mut().expect("initialized above");
        client_fragment.sum = self.client_summer.sum();

        let proposal = if reached_eof
            && stream_err.is_none()
            && pln.send_err().is_none()
            && self.status == Status::Ok
        {
            assert!(self.client_commit, "commit without client commit chunk");
            // Commit: peers validate the extended fragment and commit it.
            pln.with_spool(|s| s.next())
        } else {
            // Roll back any partial content; the pipeline stays healthy.
            self.err = self.err.take().or(stream_err);
            pln.with_spool(|s| s.fragment().clone())
        };

        pln.scatter(&ReplReq {
            header: None,
            journal: None,
            proposal: Some(proposal),
            acknowledge: true,
            content: Bytes::new(),
            content_delta: 0,
        });
        self.state = AppendState::ReadAcknowledgements;
    }

    fn on_read_acknowledgements(&mut self) {
        self.must_state(AppendState::ReadAcknowledgements);

        let pln = self.pln.take().expect("pipeline held");

        // Claim our receive turn, then release the send side: a healthy
        // pipeline is reused by the next appender, a broken one leaves the
        // rebuild sentinel.
        let send_err = pln.send_err();
        let (wait_for, close_after) = pln.barrier();

        let pln_return = self.pln_return.take().expect("pipeline slot held");
        if send_err.is_none() {
            let _ = pln_return.send(Some(Arc::clone(&pln)));
        } else {
            pln.close_send();
            let _ = pln_return.send(None);
        }

        // Pipelined appends ahead of us read their responses first.
        let _ = wait_for.recv();
        pln.gather_ok();
        if send_err.is_some() {
            pln.gather_eof();
        }
        drop(close_after);

        if self.err.is_some() || self.status != Status::Ok {
            self.state = AppendState::Error;
        } else if let Some(err) = pln.recv_err() {
            self.err = Some(err.into());
            self.state = AppendState::Error;
        } else if let Some(err) = send_err {
            self.err = Some(err.into());
            self.state = AppendState::Error;
        } else {
            self.state = AppendState::Finished;
        }
    }

    fn outcome(mut self) -> AppendOutcome {
        match self.state {
            AppendState::Finished => {
                let res = self.resolved.expect("finished implies resolved");
                let commit = self.client_fragment.expect("finished implies streamed");
                let registered_length = commit.end;
                AppendOutcome::Finished {
                    header: res.header,
                    commit,
                    registered_length,
                }
            }
            AppendState::Proxy => {
                let res = self.resolved.expect("proxy implies resolved");
                AppendOutcome::Proxy { header: res.header }
            }
            AppendState::Error => {
                if let Some(err) = self.err.take() {
                    AppendOutcome::Failed(err)
                } else {
                    let res = self.resolved.expect("refusal implies resolved");
                    let status = if self.status != Status::Ok {
                        self.status
                    } else {
                        res.status
                    };
                    AppendOutcome::Refused {
                        status,
                        header: res.header,
                    }
                }
            }
            state => panic!("appendFSM finished in non-terminal state {state:?}"),
        }
    }
}

//! The spool: single-writer accumulator for a journal's open fragment.
//!
//! A spool tracks a committed extent `[begin, end)` plus `delta` buffered
//! bytes streamed beyond it. Proposals move the boundary: a proposal equal
//! to the committed fragment rolls the delta back, a proposal extending
//! exactly through the delta commits it, and an empty proposal at or past
//! the committed end completes the fragment and opens a successor. Anything
//! else earns a counter-proposal.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::core::{CompressionCodec, Fragment, JournalName, Summer, unix_ms};

use super::proto::{ReplReq, ReplResp, Status};

/// Receives fragments as the spool commits and completes them.
pub trait SpoolObserver: Send + Sync {
    /// The open fragment's committed extent grew. `content` covers the full
    /// committed range `[begin, end)`.
    fn on_commit(&self, fragment: &Fragment, content: Bytes);

    /// The fragment will never grow again; persist it.
    fn on_complete(&self, fragment: Fragment, content: Bytes);
}

/// An observer for spools whose output nobody tracks (tests, drains).
pub struct NullObserver;

impl SpoolObserver for NullObserver {
    fn on_commit(&self, _fragment: &Fragment, _content: Bytes) {}
    fn on_complete(&self, _fragment: Fragment, _content: Bytes) {}
}

pub struct Spool {
    /// Committed extent. `sum` covers `[begin, end)`.
    fragment: Fragment,
    /// Content of `[begin, end + delta)`.
    content: BytesMut,
    /// Buffered bytes beyond the committed end.
    delta: u64,
    /// Hash state through `end + delta`.
    summer: Summer,
    /// Snapshot of `summer` at the committed end, restored on rollback.
    committed_summer: Summer,
    opened_at_ms: u64,
    observer: Arc<dyn SpoolObserver>,
}

impl Spool {
    pub fn new(
        journal: JournalName,
        codec: CompressionCodec,
        observer: Arc<dyn SpoolObserver>,
    ) -> Self {
        Self {
            fragment: Fragment::empty(journal, 0, codec),
            content: BytesMut::new(),
            delta: 0,
            summer: Summer::new(),
            committed_summer: Summer::new(),
            opened_at_ms: unix_ms(),
            observer,
        }
    }

    pub fn fragment(&self) -> &Fragment {
        &self.fragment
    }

    /// Committed end offset.
    pub fn end(&self) -> u64 {
        self.fragment.end
    }

    pub fn delta(&self) -> u64 {
        self.delta
    }

    pub fn opened_at_ms(&self) -> u64 {
        self.opened_at_ms
    }

    /// The fragment this spool would commit next: the committed extent
    /// grown through every buffered byte.
    pub fn next(&self) -> Fragment {
        Fragment {
            journal: self.fragment.journal.clone(),
            begin: self.fragment.begin,
            end: self.fragment.end + self.delta,
            sum: self.summer.sum(),
            codec: self.fragment.codec,
            backing_store: None,
            mod_time_ms: 0,
        }
    }

    pub fn apply(&mut self, req: &ReplReq) -> ReplResp {
        match &req.proposal {
            Some(proposal) => self.apply_proposal(proposal),
            None => self.apply_content(&req.content, req.content_delta),
        }
    }

    fn apply_content(&mut self, content: &[u8], content_delta: u64) -> ReplResp {
        if content.is_empty() || content_delta != self.delta {
            tracing::warn!(
                journal = %self.fragment.journal,
                expected = self.delta,
                got = content_delta,
                "content chunk does not align with buffered delta"
            );
            return self.mismatch();
        }
        self.content.extend_from_slice(content);
        self.summer.update(content);
        self.delta += content.len() as u64;
        ReplResp {
            status: Status::Ok,
            header: None,
            fragment: None,
            revision: 0,
        }
    }

    fn apply_proposal(&mut self, proposal: &Fragment) -> ReplResp {
        if proposal.journal != self.fragment.journal {
            return self.mismatch();
        }

        // Rollback (or aligned no-op): the committed fragment, re-asserted.
        if proposal.equivalent(&self.fragment) {
            if self.delta > 0 {
                let keep = (self.fragment.end - self.fragment.begin) as usize;
                self.content.truncate(keep);
                self.summer = self.committed_summer.clone();
                self.delta = 0;
            }
            return self.ok();
        }

        // Commit: extend the committed extent through the buffered delta.
        if self.delta > 0
            && proposal.begin == self.fragment.begin
            && proposal.end == self.fragment.end + self.delta
            && proposal.sum == self.summer.sum()
        {
            self.fragment.end = proposal.end;
            self.fragment.sum = proposal.sum;
            self.fragment.mod_time_ms = unix_ms();
            self.committed_summer = self.summer.clone();
            self.delta = 0;
            let content = Bytes::copy_from_slice(&self.content);
            self.observer.on_commit(&self.fragment, content);
            return self.ok();
        }

        // Roll: an empty proposal at or past the committed end completes
        // the current fragment and opens a successor there. Buffered bytes
        // are discarded; peers that hold them carry the range forward.
        if proposal.is_empty() && proposal.begin >= self.fragment.end {
            if !self.fragment.is_empty() {
                let keep = (self.fragment.end - self.fragment.begin) as usize;
                let content = Bytes::copy_from_slice(&self.content[..keep]);
                self.observer.on_complete(self.fragment.clone(), content);
            }
            self.fragment = Fragment::empty(
                self.fragment.journal.clone(),
                proposal.begin,
                self.fragment.codec,
            );
            self.content.clear();
            self.delta = 0;
            self.summer = Summer::new();
            self.committed_summer = Summer::new();
            self.opened_at_ms = unix_ms();
            return self.ok();
        }

        self.mismatch()
    }

    fn ok(&self) -> ReplResp {
        ReplResp {
            status: Status::Ok,
            header: None,
            fragment: None,
            revision: 0,
        }
    }

    fn mismatch(&self) -> ReplResp {
        ReplResp {
            status: Status::FragmentMismatch,
            header: None,
            fragment: Some(self.next()),
            revision: 0,
        }
    }
}

/// The proposal an appender sends to synchronize or rotate the pipeline.
///
/// A non-zero `roll_to_offset` forces an empty fragment there. Otherwise
/// the spool's next fragment stands, unless it breached the journal's
/// length or age targets, in which case it rotates.
pub fn next_proposal(
    spool: &Spool,
    roll_to_offset: u64,
    max_length_bytes: u64,
    flush_age_ms: u64,
) -> Fragment {
    let journal = spool.fragment().journal.clone();
    let codec = spool.fragment().codec;
    if roll_to_offset != 0 {
        return Fragment::empty(journal, roll_to_offset, codec);
    }

    let next = spool.next();
    if next.is_empty() {
        return next;
    }
    if next.len() >= max_length_bytes {
        return Fragment::empty(journal, next.end, codec);
    }
    if flush_age_ms > 0 && unix_ms().saturating_sub(spool.opened_at_ms()) >= flush_age_ms {
        return Fragment::empty(journal, next.end, codec);
    }
    next
}

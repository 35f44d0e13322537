//! The read path: stream committed journal content to one client.
//!
//! Reads resolve against any route member and consume the replica's
//! fragment index. Metadata frames mark fragment transitions; content
//! frames carry committed bytes only. Blocking reads park on the index's
//! commit wakeups at the write head.

use std::io::Write;

use bytes::Bytes;
use thiserror::Error;

use crate::signal::SignalRx;

use super::frame::{FrameError, FrameWriter};
use super::proto::{Header, Message, ProtoEncodeError, ReadReq, ReadResp, Status, encode_message};
use super::resolver::{ResolveArgs, ResolveError};
use super::service::BrokerCore;
use crate::store::StoreError;

#[derive(Debug)]
pub enum ReadOutcome {
    /// The stream was served (or refused) locally and is complete.
    Served,
    /// The caller should forward the request to `header.process_id`.
    Proxy { header: Header },
}

#[derive(Debug, Error)]
pub enum ReadServeError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Encode(#[from] ProtoEncodeError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub fn serve_read<W: Write>(
    core: &BrokerCore,
    req: &ReadReq,
    writer: &mut FrameWriter<W>,
    cancel: &SignalRx,
) -> Result<ReadOutcome, ReadServeError> {
    let res = core.resolver.resolve(ResolveArgs {
        journal: req.journal.clone(),
        require_primary: false,
        may_proxy: !req.do_not_proxy,
        min_revision: 0,
        proxy_header: req.header.as_ref(),
        cancel,
    })?;

    if res.status != Status::Ok {
        send(
            writer,
            ReadResp {
                status: res.status,
                header: Some(res.header),
                offset: req.offset,
                write_head: 0,
                fragment: None,
                fragment_url: None,
                content: Bytes::new(),
            },
        )?;
        return Ok(ReadOutcome::Served);
    }
    if res.header.process_id != res.local_id {
        return Ok(ReadOutcome::Proxy { header: res.header });
    }

    let spec = res.spec.as_ref().expect("status OK implies a spec");
    if !spec.access.may_read() {
        send(
            writer,
            ReadResp {
                status: Status::NotAllowed,
                header: Some(res.header.clone()),
                offset: req.offset,
                write_head: 0,
                fragment: None,
                fragment_url: None,
                content: Bytes::new(),
            },
        )?;
        return Ok(ReadOutcome::Served);
    }

    let replica = res.replica.clone().expect("local member has a replica");
    let commits = replica.index.subscribe();
    let mut offset = req.offset;
    let mut sent_header = false;

    loop {
        if cancel.is_fired() || replica.shutdown_rx().is_fired() {
            return Ok(ReadOutcome::Served);
        }

        let write_head = replica.index.end_offset();
        let entry = if offset < write_head {
            replica.index.query(offset)
        } else {
            None
        };
        let Some(entry) = entry else {
            if req.block {
                crossbeam::select! {
                    recv(commits) -> pulse => {
                        if pulse.is_err() {
                            return Ok(ReadOutcome::Served);
                        }
                    }
                    recv(cancel.receiver()) -> _ => return Ok(ReadOutcome::Served),
                    recv(replica.shutdown_rx().receiver()) -> _ => {
                        return Ok(ReadOutcome::Served)
                    }
                }
                continue;
            }
            send(
                writer,
                ReadResp {
                    status: Status::OffsetNotYetAvailable,
                    header: (!sent_header).then(|| res.header.clone()),
                    offset,
                    write_head,
                    fragment: None,
                    fragment_url: None,
                    content: Bytes::new(),
                },
            )?;
            return Ok(ReadOutcome::Served);
        };

        let fragment = entry.fragment.clone();
        if fragment.begin > offset {
            // The requested range was dropped or never written; skip to
            // the next covered offset.
            offset = fragment.begin;
        }
        let fragment_url = fragment
            .backing_store
            .as_ref()
            .and_then(|root| core.stores.get(root))
            .map(|store| store.url_for(&fragment));

        send(
            writer,
            ReadResp {
                status: Status::Ok,
                header: (!sent_header).then(|| res.header.clone()),
                offset,
                write_head,
                fragment: Some(fragment.clone()),
                fragment_url,
                content: Bytes::new(),
            },
        )?;
        sent_header = true;
        if req.metadata_only {
            return Ok(ReadOutcome::Served);
        }

        match entry.content {
            Some(content) => {
                while offset < fragment.end {
                    let start = (offset - fragment.begin) as usize;
                    let len = core
                        .limits
                        .read_chunk_bytes
                        .min((fragment.end - offset) as usize);
                    send_content(writer, offset, content.slice(start..start + len))?;
                    offset += len as u64;
                }
            }
            None => {
                // A store-resident fragment. Clients that refused proxying
                // get the URL only and read the store themselves.
                if req.do_not_proxy {
                    return Ok(ReadOutcome::Served);
                }
                let Some(store) = fragment
                    .backing_store
                    .as_ref()
                    .and_then(|root| core.stores.get(root))
                else {
                    tracing::warn!(fragment = %fragment, "no store registered for remote fragment");
                    return Ok(ReadOutcome::Served);
                };
                while offset < fragment.end {
                    let bytes = store.read(&fragment, offset, core.limits.read_chunk_bytes)?;
                    if bytes.is_empty() {
                        break;
                    }
                    let read = bytes.len() as u64;
                    send_content(writer, offset, bytes)?;
                    offset += read;
                }
            }
        }
    }
}

fn send<W: Write>(writer: &mut FrameWriter<W>, resp: ReadResp) -> Result<(), ReadServeError> {
    let frame = encode_message(&Message::ReadResp(resp))?;
    writer.write_frame(&frame)?;
    Ok(())
}

fn send_content<W: Write>(
    writer: &mut FrameWriter<W>,
    offset: u64,
    content: Bytes,
) -> Result<(), ReadServeError> {
    send(
        writer,
        ReadResp {
            status: Status::Ok,
            header: None,
            offset,
            write_head: 0,
            fragment: None,
            fragment_url: None,
            content,
        },
    )
}

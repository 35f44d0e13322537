//! The broker's TCP surface.
//!
//! One connection carries one RPC stream; the first frame selects it.
//! Append connections get a chunk-pump thread feeding the FSM, read
//! connections stream from the replica index, and replicate connections
//! hold the replica's spool for their lifetime.

use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Sender, bounded};
use thiserror::Error;

use crate::core::Limits;

use super::append::{AppendFsm, AppendOutcome, ChunkEvent};
use super::client::{dial, relay_frames};
use super::frame::{FrameError, FrameReader, FrameWriter};
use super::proto::{
    AppendReq, AppendResp, Header, Message, ProtoDecodeError, ProtoEncodeError, ReadReq, ReplReq,
    ReplResp, Status, decode_message, encode_message,
};
use super::read::{ReadOutcome, serve_read};
use super::resolver::ResolveArgs;
use super::service::BrokerCore;

#[derive(Debug, Error)]
enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] ProtoDecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] ProtoEncodeError),
}

/// Serve the listener until the core's shutdown signal fires.
pub fn serve(core: Arc<BrokerCore>, listener: TcpListener) -> JoinHandle<()> {
    thread::spawn(move || accept_loop(core, listener))
}

fn accept_loop(core: Arc<BrokerCore>, listener: TcpListener) {
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!("listener failed to set nonblocking: {err}");
        return;
    }
    let active = Arc::new(AtomicUsize::new(0));

    loop {
        if core.shutdown_rx.is_fired() {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let Some(guard) = ConnectionGuard::try_acquire(&active, core.limits.max_connections)
                else {
                    tracing::warn!("connection limit reached; refusing connection");
                    drop(stream);
                    continue;
                };
                let core = Arc::clone(&core);
                thread::spawn(move || {
                    let _guard = guard;
                    if let Err(err) = handle_conn(&core, stream) {
                        tracing::debug!("connection ended: {err}");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                tracing::warn!("accept error: {err}");
                thread::sleep(Duration::from_millis(25));
            }
        }
    }
}

struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn try_acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= max {
                return None;
            }
            match active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Self {
                        active: Arc::clone(active),
                    });
                }
                Err(next) => current = next,
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "active connection counter underflow");
    }
}

fn handle_conn(core: &BrokerCore, stream: TcpStream) -> Result<(), ConnectionError> {
    stream.set_nodelay(true)?;
    let mut reader = FrameReader::new(stream.try_clone()?, core.limits.max_frame_bytes);
    let mut writer = FrameWriter::new(stream.try_clone()?, core.limits.max_frame_bytes);

    let result = match reader.read_next()? {
        None => Ok(()),
        Some(first) => match decode_message(&first, &core.limits)? {
            Message::AppendReq(req) => handle_append(core, req, reader, &mut writer),
            Message::ReadReq(req) => handle_read(core, req, &mut writer),
            Message::ReplReq(req) => handle_replicate(core, req, reader, &mut writer),
            other => {
                tracing::warn!("connection opened with unexpected message {other:?}");
                Ok(())
            }
        },
    };
    // Reader clones may outlive us in pump threads; an explicit shutdown
    // delivers EOF to the client regardless.
    let _ = stream.shutdown(Shutdown::Both);
    result
}

fn write_message<W: std::io::Write>(
    writer: &mut FrameWriter<W>,
    message: &Message,
) -> Result<(), ConnectionError> {
    let frame = encode_message(message)?;
    writer.write_frame(&frame)?;
    Ok(())
}

fn handle_append(
    core: &BrokerCore,
    req: AppendReq,
    reader: FrameReader<TcpStream>,
    writer: &mut FrameWriter<TcpStream>,
) -> Result<(), ConnectionError> {
    // Pump chunk reads on their own thread: they may block indefinitely,
    // and the FSM must keep consuming timer ticks meanwhile.
    let (chunk_tx, chunk_rx) = bounded(8);
    let limits = core.limits.clone();
    thread::spawn(move || pump_chunks(reader, chunk_tx, limits));

    let cancel = core.shutdown_rx.clone();
    let outcome = AppendFsm::new(core, req.clone(), &cancel).run(&chunk_rx);

    match outcome {
        AppendOutcome::Finished {
            header,
            commit,
            registered_length,
        } => write_message(
            writer,
            &Message::AppendResp(AppendResp {
                status: Status::Ok,
                header,
                commit: Some(commit),
                registered_length,
            }),
        ),
        AppendOutcome::Refused { status, header } => write_message(
            writer,
            &Message::AppendResp(AppendResp {
                status,
                header,
                commit: None,
                registered_length: 0,
            }),
        ),
        AppendOutcome::Failed(err) => {
            tracing::info!(journal = %req.journal, "append failed: {err}");
            Ok(())
        }
        AppendOutcome::Proxy { header } => proxy_append(core, req, header, &chunk_rx, writer),
    }
}

fn pump_chunks(mut reader: FrameReader<TcpStream>, tx: Sender<ChunkEvent>, limits: Limits) {
    loop {
        match reader.read_next() {
            Ok(None) => {
                let _ = tx.send(ChunkEvent::Eof);
                return;
            }
            Ok(Some(frame)) => match decode_message(&frame, &limits) {
                Ok(Message::AppendChunk(chunk)) => {
                    if tx.send(ChunkEvent::Chunk(chunk)).is_err() {
                        return;
                    }
                }
                Ok(other) => {
                    let _ = tx.send(ChunkEvent::Err(format!(
                        "expected content chunk, got {other:?}"
                    )));
                    return;
                }
                Err(err) => {
                    let _ = tx.send(ChunkEvent::Err(err.to_string()));
                    return;
                }
            },
            Err(err) => {
                let _ = tx.send(ChunkEvent::Err(err.to_string()));
                return;
            }
        }
    }
}

/// Forward an append to the responsible broker, relaying the client's
/// remaining chunks and the broker's response.
fn proxy_append(
    core: &BrokerCore,
    req: AppendReq,
    header: Header,
    chunks: &crossbeam::channel::Receiver<ChunkEvent>,
    writer: &mut FrameWriter<TcpStream>,
) -> Result<(), ConnectionError> {
    let Some(addr) = core.member_addr(&header.process_id) else {
        tracing::warn!(peer = %header.process_id, "no address for append proxy target");
        return Ok(());
    };
    tracing::debug!(journal = %req.journal, peer = %header.process_id, "proxying append");

    let stream = dial(&addr, core.limits.connect_timeout_ms)?;
    let mut peer_writer = FrameWriter::new(stream.try_clone()?, core.limits.max_frame_bytes);
    let mut peer_reader = FrameReader::new(stream.try_clone()?, core.limits.max_frame_bytes);

    write_message(
        &mut peer_writer,
        &Message::AppendReq(AppendReq {
            journal: req.journal,
            offset: req.offset,
            header: Some(header),
            do_not_proxy: true,
        }),
    )?;

    loop {
        match chunks.recv() {
            Ok(ChunkEvent::Chunk(chunk)) => {
                write_message(&mut peer_writer, &Message::AppendChunk(chunk))?;
            }
            Ok(ChunkEvent::Eof) => {
                let _ = stream.shutdown(Shutdown::Write);
                break;
            }
            Ok(ChunkEvent::Deadline) | Ok(ChunkEvent::Err(_)) | Err(_) => {
                // Broken client stream: abandon the proxied append.
                return Ok(());
            }
        }
    }

    relay_frames(&mut peer_reader, writer)?;
    Ok(())
}

fn handle_read(
    core: &BrokerCore,
    req: ReadReq,
    writer: &mut FrameWriter<TcpStream>,
) -> Result<(), ConnectionError> {
    let cancel = core.shutdown_rx.clone();
    match serve_read(core, &req, writer, &cancel) {
        Ok(ReadOutcome::Served) => Ok(()),
        Ok(ReadOutcome::Proxy { header }) => proxy_read(core, req, header, writer),
        Err(err) => {
            tracing::info!(journal = %req.journal, "read failed: {err}");
            Ok(())
        }
    }
}

fn proxy_read(
    core: &BrokerCore,
    req: ReadReq,
    header: Header,
    writer: &mut FrameWriter<TcpStream>,
) -> Result<(), ConnectionError> {
    let Some(addr) = core.member_addr(&header.process_id) else {
        tracing::warn!(peer = %header.process_id, "no address for read proxy target");
        return Ok(());
    };
    tracing::debug!(journal = %req.journal, peer = %header.process_id, "proxying read");

    let stream = dial(&addr, core.limits.connect_timeout_ms)?;
    let mut peer_writer = FrameWriter::new(stream.try_clone()?, core.limits.max_frame_bytes);
    let mut peer_reader = FrameReader::new(stream, core.limits.max_frame_bytes);

    write_message(
        &mut peer_writer,
        &Message::ReadReq(ReadReq {
            header: Some(header),
            do_not_proxy: true,
            ..req
        }),
    )?;
    relay_frames(&mut peer_reader, writer)?;
    Ok(())
}

/// Serve one inbound replicate stream: validate routing, hold the
/// replica's spool, and apply requests until EOF.
fn handle_replicate(
    core: &BrokerCore,
    first: ReplReq,
    mut reader: FrameReader<TcpStream>,
    writer: &mut FrameWriter<TcpStream>,
) -> Result<(), ConnectionError> {
    let (Some(header), Some(journal)) = (first.header.clone(), first.journal.clone()) else {
        tracing::warn!("replicate stream opened without header and journal");
        return Ok(());
    };

    let res = match core.resolver.resolve(ResolveArgs {
        journal: journal.clone(),
        require_primary: false,
        may_proxy: false,
        min_revision: header.revision,
        proxy_header: None,
        cancel: &core.shutdown_rx,
    }) {
        Ok(res) => res,
        Err(err) => {
            tracing::info!(journal = %journal, "replicate resolve failed: {err}");
            return Ok(());
        }
    };

    if res.status != Status::Ok {
        write_message(
            writer,
            &Message::ReplResp(ReplResp {
                status: res.status,
                header: Some(res.header.clone()),
                fragment: None,
                revision: res.header.revision,
            }),
        )?;
        return Ok(());
    }
    if !res.header.route.equivalent(&header.route) {
        // This mirror knows a different route, at least as recent as the
        // primary's. The primary re-resolves through our revision.
        write_message(
            writer,
            &Message::ReplResp(ReplResp {
                status: Status::WrongRoute,
                header: Some(res.header.clone()),
                fragment: None,
                revision: res.header.revision,
            }),
        )?;
        return Ok(());
    }

    let replica = res.replica.clone().expect("local member has a replica");
    let mut spool = crossbeam::select! {
        recv(replica.spool_slot()) -> spool => match spool {
            Ok(spool) => spool,
            Err(_) => return Ok(()),
        },
        recv(core.shutdown_rx.receiver()) -> _ => return Ok(()),
        recv(replica.shutdown_rx().receiver()) -> _ => return Ok(()),
    };

    let result = replicate_loop(core, &first, &mut spool, &mut reader, writer);
    replica.return_spool(spool);
    result
}

fn replicate_loop(
    core: &BrokerCore,
    first: &ReplReq,
    spool: &mut super::spool::Spool,
    reader: &mut FrameReader<TcpStream>,
    writer: &mut FrameWriter<TcpStream>,
) -> Result<(), ConnectionError> {
    let resp = spool.apply(first);
    if first.acknowledge {
        write_message(writer, &Message::ReplResp(resp))?;
    }

    loop {
        let Some(frame) = reader.read_next()? else {
            return Ok(());
        };
        let req = match decode_message(&frame, &core.limits)? {
            Message::ReplReq(req) => req,
            other => {
                tracing::warn!("replicate stream carried unexpected message {other:?}");
                return Ok(());
            }
        };
        let resp = spool.apply(&req);
        if req.acknowledge {
            write_message(writer, &Message::ReplResp(resp))?;
        }
    }
}

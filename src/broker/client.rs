//! Outbound broker connections: dialing, and the TCP replicate connector.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::core::{Limits, ProcessId};

use super::frame::{FrameReader, FrameWriter};
use super::pipeline::{Connector, PeerReceiver, PeerSender};
use super::proto::{Message, ReplReq, ReplResp, decode_message, encode_message};

/// Dial `addr` with the configured connect timeout.
pub fn dial(addr: &str, connect_timeout_ms: u64) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for resolved in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(
            &resolved,
            Duration::from_millis(connect_timeout_ms.max(1)),
        ) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no addresses for {addr}"),
        )
    }))
}

/// Opens framed replicate streams to peer brokers over TCP.
pub struct TcpConnector {
    limits: Limits,
}

impl TcpConnector {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        peer: &ProcessId,
        addr: &str,
    ) -> Result<(Box<dyn PeerSender>, Box<dyn PeerReceiver>), std::io::Error> {
        tracing::debug!(peer = %peer, addr = %addr, "opening replicate stream");
        let stream = dial(addr, self.limits.connect_timeout_ms)?;
        let reader = stream.try_clone()?;
        Ok((
            Box::new(TcpPeerSender {
                writer: FrameWriter::new(stream.try_clone()?, self.limits.max_frame_bytes),
                stream,
            }),
            Box::new(TcpPeerReceiver {
                reader: FrameReader::new(reader, self.limits.max_frame_bytes),
                limits: self.limits.clone(),
            }),
        ))
    }
}

struct TcpPeerSender {
    writer: FrameWriter<TcpStream>,
    stream: TcpStream,
}

impl PeerSender for TcpPeerSender {
    fn send(&mut self, req: &ReplReq) -> Result<(), std::io::Error> {
        let frame = encode_message(&Message::ReplReq(req.clone()))
            .map_err(std::io::Error::other)?;
        self.writer
            .write_frame(&frame)
            .map_err(std::io::Error::other)
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Write);
    }
}

struct TcpPeerReceiver {
    reader: FrameReader<TcpStream>,
    limits: Limits,
}

impl PeerReceiver for TcpPeerReceiver {
    fn recv(&mut self) -> Result<Option<ReplResp>, std::io::Error> {
        let Some(frame) = self.reader.read_next().map_err(std::io::Error::other)? else {
            return Ok(None);
        };
        match decode_message(&frame, &self.limits).map_err(std::io::Error::other)? {
            Message::ReplResp(resp) => Ok(Some(resp)),
            other => Err(std::io::Error::other(format!(
                "expected REPL_RESP, got {other:?}"
            ))),
        }
    }
}

/// Copy frames from `reader` to `writer` until EOF. Used by read and
/// append proxying.
pub fn relay_frames<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
) -> Result<(), std::io::Error> {
    while let Some(frame) = reader.read_next().map_err(std::io::Error::other)? {
        writer.write_frame(&frame).map_err(std::io::Error::other)?;
    }
    Ok(())
}

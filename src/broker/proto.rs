//! RPC message schemas and CBOR encoding.
//!
//! Every frame payload is an envelope map `{"type": <TYPE>, "body": {...}}`.
//! Encoding is hand-written against `minicbor` so decode limits are enforced
//! as bytes stream in: indefinite-length items are rejected, unknown map
//! keys are skipped, and trailing bytes fail the message.

use std::convert::Infallible;
use std::fmt;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{
    CompressionCodec, Fragment, JournalName, Limits, ProcessId, Route, SUM_LEN, Sha1Sum,
};
use crate::coord::Revision;

/// RPC status codes carried in responses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Ok,
    JournalNotFound,
    NoJournalPrimaryBroker,
    NotJournalBroker,
    NotJournalPrimaryBroker,
    InsufficientJournalBrokers,
    WrongRoute,
    FragmentMismatch,
    IndexHasGreaterOffset,
    WrongAppendOffset,
    OffsetNotYetAvailable,
    NotAllowed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::JournalNotFound => "JOURNAL_NOT_FOUND",
            Status::NoJournalPrimaryBroker => "NO_JOURNAL_PRIMARY_BROKER",
            Status::NotJournalBroker => "NOT_JOURNAL_BROKER",
            Status::NotJournalPrimaryBroker => "NOT_JOURNAL_PRIMARY_BROKER",
            Status::InsufficientJournalBrokers => "INSUFFICIENT_JOURNAL_BROKERS",
            Status::WrongRoute => "WRONG_ROUTE",
            Status::FragmentMismatch => "FRAGMENT_MISMATCH",
            Status::IndexHasGreaterOffset => "INDEX_HAS_GREATER_OFFSET",
            Status::WrongAppendOffset => "WRONG_APPEND_OFFSET",
            Status::OffsetNotYetAvailable => "OFFSET_NOT_YET_AVAILABLE",
            Status::NotAllowed => "NOT_ALLOWED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OK" => Some(Status::Ok),
            "JOURNAL_NOT_FOUND" => Some(Status::JournalNotFound),
            "NO_JOURNAL_PRIMARY_BROKER" => Some(Status::NoJournalPrimaryBroker),
            "NOT_JOURNAL_BROKER" => Some(Status::NotJournalBroker),
            "NOT_JOURNAL_PRIMARY_BROKER" => Some(Status::NotJournalPrimaryBroker),
            "INSUFFICIENT_JOURNAL_BROKERS" => Some(Status::InsufficientJournalBrokers),
            "WRONG_ROUTE" => Some(Status::WrongRoute),
            "FRAGMENT_MISMATCH" => Some(Status::FragmentMismatch),
            "INDEX_HAS_GREATER_OFFSET" => Some(Status::IndexHasGreaterOffset),
            "WRONG_APPEND_OFFSET" => Some(Status::WrongAppendOffset),
            "OFFSET_NOT_YET_AVAILABLE" => Some(Status::OffsetNotYetAvailable),
            "NOT_ALLOWED" => Some(Status::NotAllowed),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Routing context attached to proxied and replicated requests: who
/// resolved, to what route, at which coordination-store revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub process_id: ProcessId,
    pub route: Route,
    pub revision: Revision,
    pub cluster_id: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    AppendReq(AppendReq),
    AppendChunk(AppendChunk),
    AppendResp(AppendResp),
    ReadReq(ReadReq),
    ReadResp(ReadResp),
    ReplReq(ReplReq),
    ReplResp(ReplResp),
}

/// Opens an append stream. Chunks follow; an empty chunk then EOF commits.
#[derive(Clone, Debug, PartialEq)]
pub struct AppendReq {
    pub journal: JournalName,
    /// Required next write offset, or 0 to accept the broker's head.
    pub offset: u64,
    pub header: Option<Header>,
    pub do_not_proxy: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppendChunk {
    pub content: Bytes,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppendResp {
    pub status: Status,
    pub header: Header,
    /// The fragment extent which covers this append's content.
    pub commit: Option<Fragment>,
    /// Journal write head after the commit.
    pub registered_length: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadReq {
    pub journal: JournalName,
    pub offset: u64,
    pub block: bool,
    pub do_not_proxy: bool,
    pub metadata_only: bool,
    pub header: Option<Header>,
}

/// One read stream frame: metadata (fragment transitions) or content.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadResp {
    pub status: Status,
    pub header: Option<Header>,
    pub offset: u64,
    pub write_head: u64,
    pub fragment: Option<Fragment>,
    pub fragment_url: Option<String>,
    pub content: Bytes,
}

/// One replication stream request: a content delta or a proposal.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplReq {
    /// Set on the first request of a stream, with `journal`.
    pub header: Option<Header>,
    pub journal: Option<JournalName>,
    pub proposal: Option<Fragment>,
    pub acknowledge: bool,
    pub content: Bytes,
    /// Buffered (uncommitted) bytes the sender holds ahead of this chunk.
    pub content_delta: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReplResp {
    pub status: Status,
    pub header: Option<Header>,
    /// The peer's counter-proposal, on FRAGMENT_MISMATCH.
    pub fragment: Option<Fragment>,
    /// The peer's mirror revision, on WRONG_ROUTE.
    pub revision: Revision,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    AppendReq,
    AppendChunk,
    AppendResp,
    ReadReq,
    ReadResp,
    ReplReq,
    ReplResp,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::AppendReq => "APPEND_REQ",
            MessageType::AppendChunk => "APPEND_CHUNK",
            MessageType::AppendResp => "APPEND_RESP",
            MessageType::ReadReq => "READ_REQ",
            MessageType::ReadResp => "READ_RESP",
            MessageType::ReplReq => "REPL_REQ",
            MessageType::ReplResp => "REPL_RESP",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "APPEND_REQ" => Some(MessageType::AppendReq),
            "APPEND_CHUNK" => Some(MessageType::AppendChunk),
            "APPEND_RESP" => Some(MessageType::AppendResp),
            "READ_REQ" => Some(MessageType::ReadReq),
            "READ_RESP" => Some(MessageType::ReadResp),
            "REPL_REQ" => Some(MessageType::ReplReq),
            "REPL_RESP" => Some(MessageType::ReplResp),
            _ => None,
        }
    }
}

impl Message {
    fn message_type(&self) -> MessageType {
        match self {
            Message::AppendReq(_) => MessageType::AppendReq,
            Message::AppendChunk(_) => MessageType::AppendChunk,
            Message::AppendResp(_) => MessageType::AppendResp,
            Message::ReadReq(_) => MessageType::ReadReq,
            Message::ReadResp(_) => MessageType::ReadResp,
            Message::ReplReq(_) => MessageType::ReplReq,
            Message::ReplResp(_) => MessageType::ReplResp,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

type Enc<'a> = Encoder<&'a mut Vec<u8>>;
type DecodeResult<T> = Result<T, ProtoDecodeError>;

pub fn encode_message(message: &Message) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(2)?;
    enc.str("type")?;
    enc.str(message.message_type().as_str())?;
    enc.str("body")?;
    match message {
        Message::AppendReq(msg) => encode_append_req(&mut enc, msg)?,
        Message::AppendChunk(msg) => encode_append_chunk(&mut enc, msg)?,
        Message::AppendResp(msg) => encode_append_resp(&mut enc, msg)?,
        Message::ReadReq(msg) => encode_read_req(&mut enc, msg)?,
        Message::ReadResp(msg) => encode_read_resp(&mut enc, msg)?,
        Message::ReplReq(msg) => encode_repl_req(&mut enc, msg)?,
        Message::ReplResp(msg) => encode_repl_resp(&mut enc, msg)?,
    }
    Ok(buf)
}

pub fn decode_message(bytes: &[u8], limits: &Limits) -> DecodeResult<Message> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits)?;

    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "type" => {
                let raw = decode_text(&mut dec, limits)?;
                message_type = Some(
                    MessageType::parse(raw)
                        .ok_or_else(|| ProtoDecodeError::UnknownMessageType(raw.to_string()))?,
                );
            }
            "body" => {
                let start = dec.position();
                skip_strict(&mut dec)?;
                body_span = Some((start, dec.position()));
            }
            _ => skip_strict(&mut dec)?,
        }
    }
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    let message_type = message_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;
    let mut dec = Decoder::new(&bytes[start..end]);

    let message = match message_type {
        MessageType::AppendReq => Message::AppendReq(decode_append_req(&mut dec, limits)?),
        MessageType::AppendChunk => Message::AppendChunk(decode_append_chunk(&mut dec, limits)?),
        MessageType::AppendResp => Message::AppendResp(decode_append_resp(&mut dec, limits)?),
        MessageType::ReadReq => Message::ReadReq(decode_read_req(&mut dec, limits)?),
        MessageType::ReadResp => Message::ReadResp(decode_read_resp(&mut dec, limits)?),
        MessageType::ReplReq => Message::ReplReq(decode_repl_req(&mut dec, limits)?),
        MessageType::ReplResp => Message::ReplResp(decode_repl_resp(&mut dec, limits)?),
    };
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(message)
}

fn encode_append_req(enc: &mut Enc, msg: &AppendReq) -> Result<(), ProtoEncodeError> {
    let mut len = 3;
    if msg.header.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("journal")?;
    enc.str(msg.journal.as_str())?;
    enc.str("offset")?;
    enc.u64(msg.offset)?;
    if let Some(header) = &msg.header {
        enc.str("header")?;
        encode_header(enc, header)?;
    }
    enc.str("do_not_proxy")?;
    enc.bool(msg.do_not_proxy)?;
    Ok(())
}

fn decode_append_req(dec: &mut Decoder, limits: &Limits) -> DecodeResult<AppendReq> {
    let map_len = decode_map_len(dec, limits)?;
    let mut journal = None;
    let mut offset = None;
    let mut header = None;
    let mut do_not_proxy = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "journal" => journal = Some(decode_journal(dec, limits)?),
            "offset" => offset = Some(dec.u64()?),
            "header" => header = Some(decode_header(dec, limits)?),
            "do_not_proxy" => do_not_proxy = Some(dec.bool()?),
            _ => skip_strict(dec)?,
        }
    }
    Ok(AppendReq {
        journal: journal.ok_or(ProtoDecodeError::MissingField("journal"))?,
        offset: offset.ok_or(ProtoDecodeError::MissingField("offset"))?,
        header,
        do_not_proxy: do_not_proxy.ok_or(ProtoDecodeError::MissingField("do_not_proxy"))?,
    })
}

fn encode_append_chunk(enc: &mut Enc, msg: &AppendChunk) -> Result<(), ProtoEncodeError> {
    enc.map(1)?;
    enc.str("content")?;
    enc.bytes(&msg.content)?;
    Ok(())
}

fn decode_append_chunk(dec: &mut Decoder, limits: &Limits) -> DecodeResult<AppendChunk> {
    let map_len = decode_map_len(dec, limits)?;
    let mut content = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "content" => content = Some(decode_bytes(dec, limits)?),
            _ => skip_strict(dec)?,
        }
    }
    Ok(AppendChunk {
        content: content.ok_or(ProtoDecodeError::MissingField("content"))?,
    })
}

fn encode_append_resp(enc: &mut Enc, msg: &AppendResp) -> Result<(), ProtoEncodeError> {
    let mut len = 3;
    if msg.commit.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("status")?;
    enc.str(msg.status.as_str())?;
    enc.str("header")?;
    encode_header(enc, &msg.header)?;
    if let Some(commit) = &msg.commit {
        enc.str("commit")?;
        encode_fragment(enc, commit)?;
    }
    enc.str("registered_length")?;
    enc.u64(msg.registered_length)?;
    Ok(())
}

fn decode_append_resp(dec: &mut Decoder, limits: &Limits) -> DecodeResult<AppendResp> {
    let map_len = decode_map_len(dec, limits)?;
    let mut status = None;
    let mut header = None;
    let mut commit = None;
    let mut registered_length = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "status" => status = Some(decode_status(dec, limits)?),
            "header" => header = Some(decode_header(dec, limits)?),
            "commit" => commit = Some(decode_fragment(dec, limits)?),
            "registered_length" => registered_length = Some(dec.u64()?),
            _ => skip_strict(dec)?,
        }
    }
    Ok(AppendResp {
        status: status.ok_or(ProtoDecodeError::MissingField("status"))?,
        header: header.ok_or(ProtoDecodeError::MissingField("header"))?,
        commit,
        registered_length: registered_length
            .ok_or(ProtoDecodeError::MissingField("registered_length"))?,
    })
}

fn encode_read_req(enc: &mut Enc, msg: &ReadReq) -> Result<(), ProtoEncodeError> {
    let mut len = 5;
    if msg.header.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("journal")?;
    enc.str(msg.journal.as_str())?;
    enc.str("offset")?;
    enc.u64(msg.offset)?;
    enc.str("block")?;
    enc.bool(msg.block)?;
    enc.str("do_not_proxy")?;
    enc.bool(msg.do_not_proxy)?;
    enc.str("metadata_only")?;
    enc.bool(msg.metadata_only)?;
    if let Some(header) = &msg.header {
        enc.str("header")?;
        encode_header(enc, header)?;
    }
    Ok(())
}

fn decode_read_req(dec: &mut Decoder, limits: &Limits) -> DecodeResult<ReadReq> {
    let map_len = decode_map_len(dec, limits)?;
    let mut journal = None;
    let mut offset = None;
    let mut block = None;
    let mut do_not_proxy = None;
    let mut metadata_only = None;
    let mut header = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "journal" => journal = Some(decode_journal(dec, limits)?),
            "offset" => offset = Some(dec.u64()?),
            "block" => block = Some(dec.bool()?),
            "do_not_proxy" => do_not_proxy = Some(dec.bool()?),
            "metadata_only" => metadata_only = Some(dec.bool()?),
            "header" => header = Some(decode_header(dec, limits)?),
            _ => skip_strict(dec)?,
        }
    }
    Ok(ReadReq {
        journal: journal.ok_or(ProtoDecodeError::MissingField("journal"))?,
        offset: offset.ok_or(ProtoDecodeError::MissingField("offset"))?,
        block: block.ok_or(ProtoDecodeError::MissingField("block"))?,
        do_not_proxy: do_not_proxy.ok_or(ProtoDecodeError::MissingField("do_not_proxy"))?,
        metadata_only: metadata_only.ok_or(ProtoDecodeError::MissingField("metadata_only"))?,
        header,
    })
}

fn encode_read_resp(enc: &mut Enc, msg: &ReadResp) -> Result<(), ProtoEncodeError> {
    let mut len = 4;
    if msg.header.is_some() {
        len += 1;
    }
    if msg.fragment.is_some() {
        len += 1;
    }
    if msg.fragment_url.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("status")?;
    enc.str(msg.status.as_str())?;
    if let Some(header) = &msg.header {
        enc.str("header")?;
        encode_header(enc, header)?;
    }
    enc.str("offset")?;
    enc.u64(msg.offset)?;
    enc.str("write_head")?;
    enc.u64(msg.write_head)?;
    if let Some(fragment) = &msg.fragment {
        enc.str("fragment")?;
        encode_fragment(enc, fragment)?;
    }
    if let Some(url) = &msg.fragment_url {
        enc.str("fragment_url")?;
        enc.str(url)?;
    }
    enc.str("content")?;
    enc.bytes(&msg.content)?;
    Ok(())
}

fn decode_read_resp(dec: &mut Decoder, limits: &Limits) -> DecodeResult<ReadResp> {
    let map_len = decode_map_len(dec, limits)?;
    let mut status = None;
    let mut header = None;
    let mut offset = None;
    let mut write_head = None;
    let mut fragment = None;
    let mut fragment_url = None;
    let mut content = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "status" => status = Some(decode_status(dec, limits)?),
            "header" => header = Some(decode_header(dec, limits)?),
            "offset" => offset = Some(dec.u64()?),
            "write_head" => write_head = Some(dec.u64()?),
            "fragment" => fragment = Some(decode_fragment(dec, limits)?),
            "fragment_url" => fragment_url = Some(decode_text(dec, limits)?.to_string()),
            "content" => content = Some(decode_bytes(dec, limits)?),
            _ => skip_strict(dec)?,
        }
    }
    Ok(ReadResp {
        status: status.ok_or(ProtoDecodeError::MissingField("status"))?,
        header,
        offset: offset.ok_or(ProtoDecodeError::MissingField("offset"))?,
        write_head: write_head.ok_or(ProtoDecodeError::MissingField("write_head"))?,
        fragment,
        fragment_url,
        content: content.ok_or(ProtoDecodeError::MissingField("content"))?,
    })
}

fn encode_repl_req(enc: &mut Enc, msg: &ReplReq) -> Result<(), ProtoEncodeError> {
    let mut len = 3;
    if msg.header.is_some() {
        len += 1;
    }
    if msg.journal.is_some() {
        len += 1;
    }
    if msg.proposal.is_some() {
        len += 1;
    }
    enc.map(len)?;
    if let Some(header) = &msg.header {
        enc.str("header")?;
        encode_header(enc, header)?;
    }
    if let Some(journal) = &msg.journal {
        enc.str("journal")?;
        enc.str(journal.as_str())?;
    }
    if let Some(proposal) = &msg.proposal {
        enc.str("proposal")?;
        encode_fragment(enc, proposal)?;
    }
    enc.str("acknowledge")?;
    enc.bool(msg.acknowledge)?;
    enc.str("content")?;
    enc.bytes(&msg.content)?;
    enc.str("content_delta")?;
    enc.u64(msg.content_delta)?;
    Ok(())
}

fn decode_repl_req(dec: &mut Decoder, limits: &Limits) -> DecodeResult<ReplReq> {
    let map_len = decode_map_len(dec, limits)?;
    let mut header = None;
    let mut journal = None;
    let mut proposal = None;
    let mut acknowledge = None;
    let mut content = None;
    let mut content_delta = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "header" => header = Some(decode_header(dec, limits)?),
            "journal" => journal = Some(decode_journal(dec, limits)?),
            "proposal" => proposal = Some(decode_fragment(dec, limits)?),
            "acknowledge" => acknowledge = Some(dec.bool()?),
            "content" => content = Some(decode_bytes(dec, limits)?),
            "content_delta" => content_delta = Some(dec.u64()?),
            _ => skip_strict(dec)?,
        }
    }
    Ok(ReplReq {
        header,
        journal,
        proposal,
        acknowledge: acknowledge.ok_or(ProtoDecodeError::MissingField("acknowledge"))?,
        content: content.ok_or(ProtoDecodeError::MissingField("content"))?,
        content_delta: content_delta.ok_or(ProtoDecodeError::MissingField("content_delta"))?,
    })
}

fn encode_repl_resp(enc: &mut Enc, msg: &ReplResp) -> Result<(), ProtoEncodeError> {
    let mut len = 2;
    if msg.header.is_some() {
        len += 1;
    }
    if msg.fragment.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("status")?;
    enc.str(msg.status.as_str())?;
    if let Some(header) = &msg.header {
        enc.str("header")?;
        encode_header(enc, header)?;
    }
    if let Some(fragment) = &msg.fragment {
        enc.str("fragment")?;
        encode_fragment(enc, fragment)?;
    }
    enc.str("revision")?;
    enc.u64(msg.revision)?;
    Ok(())
}

fn decode_repl_resp(dec: &mut Decoder, limits: &Limits) -> DecodeResult<ReplResp> {
    let map_len = decode_map_len(dec, limits)?;
    let mut status = None;
    let mut header = None;
    let mut fragment = None;
    let mut revision = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "status" => status = Some(decode_status(dec, limits)?),
            "header" => header = Some(decode_header(dec, limits)?),
            "fragment" => fragment = Some(decode_fragment(dec, limits)?),
            "revision" => revision = Some(dec.u64()?),
            _ => skip_strict(dec)?,
        }
    }
    Ok(ReplResp {
        status: status.ok_or(ProtoDecodeError::MissingField("status"))?,
        header,
        fragment,
        revision: revision.ok_or(ProtoDecodeError::MissingField("revision"))?,
    })
}

fn encode_header(enc: &mut Enc, header: &Header) -> Result<(), ProtoEncodeError> {
    enc.map(4)?;
    enc.str("process_id")?;
    enc.str(&header.process_id.to_string())?;
    enc.str("route")?;
    encode_route(enc, &header.route)?;
    enc.str("revision")?;
    enc.u64(header.revision)?;
    enc.str("cluster_id")?;
    enc.u64(header.cluster_id)?;
    Ok(())
}

fn decode_header(dec: &mut Decoder, limits: &Limits) -> DecodeResult<Header> {
    let map_len = decode_map_len(dec, limits)?;
    let mut process_id = None;
    let mut route = None;
    let mut revision = None;
    let mut cluster_id = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "process_id" => process_id = Some(decode_process_id(dec, limits)?),
            "route" => route = Some(decode_route(dec, limits)?),
            "revision" => revision = Some(dec.u64()?),
            "cluster_id" => cluster_id = Some(dec.u64()?),
            _ => skip_strict(dec)?,
        }
    }
    Ok(Header {
        process_id: process_id.ok_or(ProtoDecodeError::MissingField("process_id"))?,
        route: route.ok_or(ProtoDecodeError::MissingField("route"))?,
        revision: revision.ok_or(ProtoDecodeError::MissingField("revision"))?,
        cluster_id: cluster_id.ok_or(ProtoDecodeError::MissingField("cluster_id"))?,
    })
}

fn encode_route(enc: &mut Enc, route: &Route) -> Result<(), ProtoEncodeError> {
    let mut len = 1;
    if route.primary.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("members")?;
    enc.array(route.members.len() as u64)?;
    for member in &route.members {
        enc.str(&member.to_string())?;
    }
    if let Some(primary) = route.primary {
        enc.str("primary")?;
        enc.u64(primary as u64)?;
    }
    Ok(())
}

fn decode_route(dec: &mut Decoder, limits: &Limits) -> DecodeResult<Route> {
    let map_len = decode_map_len(dec, limits)?;
    let mut members = None;
    let mut primary = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "members" => {
                let len = dec
                    .array()?
                    .ok_or(ProtoDecodeError::IndefiniteLength)?;
                if len as usize > limits.max_route_members {
                    return Err(ProtoDecodeError::DecodeLimit("route members"));
                }
                let mut list = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    list.push(decode_process_id(dec, limits)?);
                }
                members = Some(list);
            }
            "primary" => primary = Some(dec.u64()? as usize),
            _ => skip_strict(dec)?,
        }
    }
    let members = members.ok_or(ProtoDecodeError::MissingField("members"))?;
    if let Some(primary) = primary
        && primary >= members.len()
    {
        return Err(ProtoDecodeError::InvalidField {
            field: "primary",
            reason: format!("index {primary} out of {} members", members.len()),
        });
    }
    Ok(Route { members, primary })
}

fn encode_fragment(enc: &mut Enc, fragment: &Fragment) -> Result<(), ProtoEncodeError> {
    let mut len = 6;
    if fragment.backing_store.is_some() {
        len += 1;
    }
    enc.map(len)?;
    enc.str("journal")?;
    enc.str(fragment.journal.as_str())?;
    enc.str("begin")?;
    enc.u64(fragment.begin)?;
    enc.str("end")?;
    enc.u64(fragment.end)?;
    enc.str("sum")?;
    enc.bytes(fragment.sum.as_bytes())?;
    enc.str("codec")?;
    enc.str(fragment.codec.as_str())?;
    if let Some(store) = &fragment.backing_store {
        enc.str("backing_store")?;
        enc.str(store)?;
    }
    enc.str("mod_time_ms")?;
    enc.u64(fragment.mod_time_ms)?;
    Ok(())
}

fn decode_fragment(dec: &mut Decoder, limits: &Limits) -> DecodeResult<Fragment> {
    let map_len = decode_map_len(dec, limits)?;
    let mut journal = None;
    let mut begin = None;
    let mut end = None;
    let mut sum = None;
    let mut codec = None;
    let mut backing_store = None;
    let mut mod_time_ms = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)? {
            "journal" => journal = Some(decode_journal(dec, limits)?),
            "begin" => begin = Some(dec.u64()?),
            "end" => end = Some(dec.u64()?),
            "sum" => {
                let raw = dec.bytes()?;
                if raw.len() != SUM_LEN {
                    return Err(ProtoDecodeError::InvalidField {
                        field: "sum",
                        reason: format!("expected {SUM_LEN} bytes, got {}", raw.len()),
                    });
                }
                let mut out = [0u8; SUM_LEN];
                out.copy_from_slice(raw);
                sum = Some(Sha1Sum(out));
            }
            "codec" => {
                let raw = decode_text(dec, limits)?;
                codec = Some(CompressionCodec::parse(raw).ok_or_else(|| {
                    ProtoDecodeError::InvalidField {
                        field: "codec",
                        reason: format!("unknown codec {raw}"),
                    }
                })?);
            }
            "backing_store" => backing_store = Some(decode_text(dec, limits)?.to_string()),
            "mod_time_ms" => mod_time_ms = Some(dec.u64()?),
            _ => skip_strict(dec)?,
        }
    }
    let fragment = Fragment {
        journal: journal.ok_or(ProtoDecodeError::MissingField("journal"))?,
        begin: begin.ok_or(ProtoDecodeError::MissingField("begin"))?,
        end: end.ok_or(ProtoDecodeError::MissingField("end"))?,
        sum: sum.ok_or(ProtoDecodeError::MissingField("sum"))?,
        codec: codec.ok_or(ProtoDecodeError::MissingField("codec"))?,
        backing_store,
        mod_time_ms: mod_time_ms.ok_or(ProtoDecodeError::MissingField("mod_time_ms"))?,
    };
    fragment
        .validate()
        .map_err(|err| ProtoDecodeError::InvalidField {
            field: "fragment",
            reason: err.to_string(),
        })?;
    Ok(fragment)
}

fn decode_status(dec: &mut Decoder, limits: &Limits) -> DecodeResult<Status> {
    let raw = decode_text(dec, limits)?;
    Status::parse(raw).ok_or_else(|| ProtoDecodeError::InvalidField {
        field: "status",
        reason: format!("unknown status {raw}"),
    })
}

fn decode_journal(dec: &mut Decoder, limits: &Limits) -> DecodeResult<JournalName> {
    let raw = decode_text(dec, limits)?;
    JournalName::parse(raw).map_err(|err| ProtoDecodeError::InvalidField {
        field: "journal",
        reason: err.to_string(),
    })
}

fn decode_process_id(dec: &mut Decoder, limits: &Limits) -> DecodeResult<ProcessId> {
    let raw = decode_text(dec, limits)?;
    ProcessId::parse(raw).map_err(|err| ProtoDecodeError::InvalidField {
        field: "process_id",
        reason: err.to_string(),
    })
}

fn decode_map_len(dec: &mut Decoder, limits: &Limits) -> DecodeResult<u64> {
    let len = dec.map()?.ok_or(ProtoDecodeError::IndefiniteLength)?;
    if len as usize > limits.max_cbor_map_entries {
        return Err(ProtoDecodeError::DecodeLimit("map entries"));
    }
    Ok(len)
}

fn decode_text<'a>(dec: &mut Decoder<'a>, limits: &Limits) -> DecodeResult<&'a str> {
    if matches!(dec.datatype()?, Type::StringIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let raw = dec.str()?;
    if raw.len() > limits.max_cbor_text_len {
        return Err(ProtoDecodeError::DecodeLimit("text length"));
    }
    Ok(raw)
}

fn decode_bytes(dec: &mut Decoder, limits: &Limits) -> DecodeResult<Bytes> {
    if matches!(dec.datatype()?, Type::BytesIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let raw = dec.bytes()?;
    if raw.len() > limits.max_cbor_bytes_len {
        return Err(ProtoDecodeError::DecodeLimit("bytes length"));
    }
    Ok(Bytes::copy_from_slice(raw))
}

fn skip_strict(dec: &mut Decoder) -> DecodeResult<()> {
    if matches!(
        dec.datatype()?,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    dec.skip()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JournalName;

    fn journal() -> JournalName {
        JournalName::parse("a/journal").unwrap()
    }

    fn header() -> Header {
        Header {
            process_id: ProcessId::parse("local#broker").unwrap(),
            route: Route {
                members: vec![
                    ProcessId::parse("local#broker").unwrap(),
                    ProcessId::parse("peer#broker").unwrap(),
                ],
                primary: Some(0),
            },
            revision: 42,
            cluster_id: 7,
        }
    }

    fn fragment() -> Fragment {
        Fragment {
            journal: journal(),
            begin: 0,
            end: 9,
            sum: Sha1Sum::of(b"foobarbaz"),
            codec: CompressionCodec::None,
            backing_store: Some("file:///store".to_string()),
            mod_time_ms: 1_700_000_000_000,
        }
    }

    fn roundtrip(message: Message) -> Message {
        let bytes = encode_message(&message).unwrap();
        let decoded = decode_message(&bytes, &Limits::default()).unwrap();
        assert_eq!(message, decoded);
        decoded
    }

    #[test]
    fn append_stream_messages() {
        roundtrip(Message::AppendReq(AppendReq {
            journal: journal(),
            offset: 0,
            header: Some(header()),
            do_not_proxy: true,
        }));
        roundtrip(Message::AppendChunk(AppendChunk {
            content: Bytes::from_static(b"foobarbaz"),
        }));
        roundtrip(Message::AppendChunk(AppendChunk {
            content: Bytes::new(),
        }));
        roundtrip(Message::AppendResp(AppendResp {
            status: Status::Ok,
            header: header(),
            commit: Some(fragment()),
            registered_length: 9,
        }));
    }

    #[test]
    fn read_stream_messages() {
        roundtrip(Message::ReadReq(ReadReq {
            journal: journal(),
            offset: 3,
            block: true,
            do_not_proxy: false,
            metadata_only: false,
            header: None,
        }));
        roundtrip(Message::ReadResp(ReadResp {
            status: Status::OffsetNotYetAvailable,
            header: Some(header()),
            offset: 9,
            write_head: 9,
            fragment: Some(fragment()),
            fragment_url: Some("file:///store/a/journal/x".to_string()),
            content: Bytes::new(),
        }));
    }

    #[test]
    fn replicate_stream_messages() {
        roundtrip(Message::ReplReq(ReplReq {
            header: Some(header()),
            journal: Some(journal()),
            proposal: Some(fragment()),
            acknowledge: true,
            content: Bytes::new(),
            content_delta: 0,
        }));
        roundtrip(Message::ReplReq(ReplReq {
            header: None,
            journal: None,
            proposal: None,
            acknowledge: false,
            content: Bytes::from_static(b"chunk"),
            content_delta: 12,
        }));
        roundtrip(Message::ReplResp(ReplResp {
            status: Status::FragmentMismatch,
            header: None,
            fragment: Some(fragment()),
            revision: 0,
        }));
        roundtrip(Message::ReplResp(ReplResp {
            status: Status::WrongRoute,
            header: Some(header()),
            fragment: None,
            revision: 99,
        }));
    }

    #[test]
    fn unknown_keys_are_skipped() {
        // An envelope with an extra key decodes; an unknown type does not.
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("ignored").unwrap();
        enc.u64(1).unwrap();
        enc.str("type").unwrap();
        enc.str("APPEND_CHUNK").unwrap();
        enc.str("body").unwrap();
        enc.map(2).unwrap();
        enc.str("content").unwrap();
        enc.bytes(b"x").unwrap();
        enc.str("future_field").unwrap();
        enc.str("whatever").unwrap();

        let decoded = decode_message(&buf, &Limits::default()).unwrap();
        assert_eq!(
            decoded,
            Message::AppendChunk(AppendChunk {
                content: Bytes::from_static(b"x"),
            })
        );
    }

    #[test]
    fn rejects_unknown_type_and_trailing_bytes() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("type").unwrap();
        enc.str("NOPE").unwrap();
        enc.str("body").unwrap();
        enc.map(0).unwrap();
        assert!(matches!(
            decode_message(&buf, &Limits::default()),
            Err(ProtoDecodeError::UnknownMessageType(_))
        ));

        let mut buf = encode_message(&Message::AppendChunk(AppendChunk {
            content: Bytes::from_static(b"x"),
        }))
        .unwrap();
        buf.push(0x00);
        assert!(matches!(
            decode_message(&buf, &Limits::default()),
            Err(ProtoDecodeError::TrailingBytes)
        ));
    }

    #[test]
    fn rejects_bad_sum_and_primary() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(2).unwrap();
        enc.str("type").unwrap();
        enc.str("REPL_RESP").unwrap();
        enc.str("body").unwrap();
        enc.map(3).unwrap();
        enc.str("status").unwrap();
        enc.str("OK").unwrap();
        enc.str("revision").unwrap();
        enc.u64(1).unwrap();
        enc.str("fragment").unwrap();
        enc.map(6).unwrap();
        enc.str("journal").unwrap();
        enc.str("a/journal").unwrap();
        enc.str("begin").unwrap();
        enc.u64(0).unwrap();
        enc.str("end").unwrap();
        enc.u64(1).unwrap();
        enc.str("sum").unwrap();
        enc.bytes(b"short").unwrap();
        enc.str("codec").unwrap();
        enc.str("none").unwrap();
        enc.str("mod_time_ms").unwrap();
        enc.u64(0).unwrap();
        assert!(matches!(
            decode_message(&buf, &Limits::default()),
            Err(ProtoDecodeError::InvalidField { field: "sum", .. })
        ));
    }

    #[test]
    fn enforces_decode_limits() {
        let mut limits = Limits::default();
        limits.max_cbor_bytes_len = 4;
        let bytes = encode_message(&Message::AppendChunk(AppendChunk {
            content: Bytes::from_static(b"too long"),
        }))
        .unwrap();
        assert!(matches!(
            decode_message(&bytes, &limits),
            Err(ProtoDecodeError::DecodeLimit(_))
        ));
    }
}

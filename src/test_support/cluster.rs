//! A multi-broker test cluster over one in-memory coordination store.

use std::collections::BTreeMap;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use crate::broker::frame::{FrameReader, FrameWriter};
use crate::broker::proto::{
    AppendChunk, AppendReq, AppendResp, Message, ReadReq, decode_message, encode_message,
};
use crate::broker::{Broker, Spool};
use crate::config::Config;
use crate::coord::{CoordStore, MemStore, keys};
use crate::core::{
    AccessMode, CompressionCodec, Fragment, JournalName, JournalSpec, Limits, ProcessId, Route,
};
use crate::signal;
use crate::store::{FileSystemStore, FragmentStore};

pub struct TestClusterOptions {
    pub limits: Limits,
    /// Store journals' fragments under the cluster's filesystem store.
    pub offload_fragments: bool,
}

impl Default for TestClusterOptions {
    fn default() -> Self {
        let mut limits = Limits::default();
        // Tight timeouts keep failure-path tests fast.
        limits.append_chunk_timeout_ms = 100;
        Self {
            limits,
            offload_fragments: false,
        }
    }
}

pub struct TestCluster {
    pub coord: Arc<MemStore>,
    pub store: Arc<FileSystemStore>,
    options: TestClusterOptions,
    brokers: BTreeMap<ProcessId, Broker>,
    _store_dir: TempDir,
}

impl TestCluster {
    /// A cluster with brokers named like `"local#broker"`.
    pub fn start(names: &[&str]) -> Self {
        Self::start_with(names, TestClusterOptions::default())
    }

    pub fn start_with(names: &[&str], options: TestClusterOptions) -> Self {
        let coord = Arc::new(MemStore::new());
        let store_dir = TempDir::new().expect("store tempdir");
        let store = Arc::new(FileSystemStore::new(store_dir.path()).expect("fs store"));

        let mut cluster = Self {
            coord,
            store,
            options,
            brokers: BTreeMap::new(),
            _store_dir: store_dir,
        };
        for name in names {
            cluster.start_broker(name);
        }
        cluster
    }

    pub fn start_broker(&mut self, name: &str) {
        let id = ProcessId::parse(name).expect("valid process id");
        let mut config = Config::default();
        config.zone = id.zone().to_string();
        config.suffix = id.suffix().to_string();
        config.listen_addr = "127.0.0.1:0".to_string();
        config.limits = self.options.limits.clone();

        let mut stores: BTreeMap<String, Arc<dyn FragmentStore>> = BTreeMap::new();
        stores.insert(
            self.store.root().to_string(),
            Arc::clone(&self.store) as Arc<dyn FragmentStore>,
        );

        let broker = Broker::start(
            &config,
            Arc::clone(&self.coord) as Arc<dyn CoordStore>,
            stores,
        )
        .expect("broker starts");
        self.brokers.insert(id, broker);
    }

    pub fn broker(&self, name: &str) -> &Broker {
        let id = ProcessId::parse(name).expect("valid process id");
        self.brokers.get(&id).expect("broker started")
    }

    /// Create a journal assigned to `members` in slot order (primary
    /// first), with every assignment advertising the full route, and wait
    /// until all brokers observe it.
    pub fn create_journal(&self, name: &str, members: &[&str]) {
        self.create_journal_with(name, members, AccessMode::ReadWrite)
    }

    pub fn create_journal_with(&self, name: &str, members: &[&str], access: AccessMode) {
        let mut spec = JournalSpec::new(JournalName::parse(name).expect("valid journal name"));
        spec.replication = members.len() as u32;
        spec.access = access;
        if self.options.offload_fragments {
            spec.fragment.stores = vec![self.store.root().to_string()];
        }
        self.create_journal_from_spec(&spec, members);
    }

    /// Create a journal from an explicit spec, assigned to `members` in
    /// slot order with the full route advertised.
    pub fn create_journal_from_spec(&self, spec: &JournalSpec, members: &[&str]) {
        let journal = spec.name.clone();
        keys::create_journal(self.coord.as_ref(), "/plume", spec).expect("create journal");

        let route = Route {
            members: members
                .iter()
                .map(|m| ProcessId::parse(m).expect("valid member"))
                .collect(),
            primary: Some(0),
        };
        let mut revision = 0;
        for (slot, member) in route.members.iter().enumerate() {
            revision = keys::assign(
                self.coord.as_ref(),
                "/plume",
                &journal,
                member,
                slot as u32,
                &route,
                None,
            )
            .expect("assign");
        }
        self.wait_revision(revision);
    }

    /// Block until every broker's mirror reaches `revision`.
    pub fn wait_revision(&self, revision: u64) {
        for broker in self.brokers.values() {
            broker
                .core()
                .resolver
                .mirror()
                .wait_for_revision(revision, &signal::never())
                .expect("mirror catches up");
        }
    }

    /// Roll a broker's spool for `journal` forward to `offset`, as a
    /// pipelined sync would.
    pub fn roll_spool(&self, broker: &str, journal: &str, offset: u64) {
        self.with_spool(broker, journal, |spool| {
            let roll = Fragment::empty(
                JournalName::parse(journal).expect("valid journal name"),
                offset,
                CompressionCodec::None,
            );
            let resp = spool.apply(&crate::broker::proto::ReplReq {
                header: None,
                journal: None,
                proposal: Some(roll),
                acknowledge: true,
                content: Bytes::new(),
                content_delta: 0,
            });
            assert_eq!(resp.status, crate::broker::proto::Status::Ok);
        });
    }

    /// Borrow a broker's spool from its mailbox, run `f`, and return it.
    pub fn with_spool(&self, broker: &str, journal: &str, f: impl FnOnce(&mut Spool)) {
        let journal = JournalName::parse(journal).expect("valid journal name");
        let replica = self
            .broker(broker)
            .core()
            .resolver
            .replica(&journal)
            .expect("replica exists");
        let mut spool = replica.spool_slot().recv().expect("spool available");
        f(&mut spool);
        replica.return_spool(spool);
    }

    pub fn limits(&self) -> Limits {
        self.options.limits.clone()
    }

    pub fn client(&self, broker: &str) -> TestClient {
        TestClient::connect(
            &self.broker(broker).local_addr().to_string(),
            self.options.limits.clone(),
        )
    }

    /// Run one append through `broker` to completion.
    pub fn append(
        &self,
        broker: &str,
        journal: &str,
        chunks: &[&[u8]],
    ) -> crate::broker::proto::AppendResp {
        TestClient::append(
            &self.broker(broker).local_addr().to_string(),
            self.limits(),
            journal,
            chunks,
        )
    }

    /// Open a read stream against `broker`.
    pub fn read(&self, broker: &str, req: ReadReq) -> TestClient {
        TestClient::read(
            &self.broker(broker).local_addr().to_string(),
            self.limits(),
            req,
        )
    }

    pub fn shutdown(self) {
        for (_, broker) in self.brokers {
            broker.shutdown();
        }
    }
}

/// A framed RPC client for tests.
pub struct TestClient {
    stream: TcpStream,
    reader: FrameReader<TcpStream>,
    writer: FrameWriter<TcpStream>,
    limits: Limits,
}

impl TestClient {
    pub fn connect(addr: &str, limits: Limits) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to broker");
        stream.set_nodelay(true).expect("nodelay");
        let reader = FrameReader::new(stream.try_clone().expect("clone"), limits.max_frame_bytes);
        let writer = FrameWriter::new(stream.try_clone().expect("clone"), limits.max_frame_bytes);
        Self {
            stream,
            reader,
            writer,
            limits,
        }
    }

    pub fn send(&mut self, message: &Message) {
        let frame = encode_message(message).expect("encode");
        self.writer.write_frame(&frame).expect("write frame");
    }

    /// Half-close: the broker observes EOF after draining our frames.
    pub fn finish_sending(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Write);
    }

    pub fn recv(&mut self) -> Option<Message> {
        let frame = self.reader.read_next().expect("read frame")?;
        Some(decode_message(&frame, &self.limits).expect("decode"))
    }

    /// Open an append stream and run it to completion: each chunk, the
    /// empty commit chunk, EOF, then the response.
    pub fn append(addr: &str, limits: Limits, journal: &str, chunks: &[&[u8]]) -> AppendResp {
        let mut client = Self::connect(addr, limits);
        client.send(&Message::AppendReq(AppendReq {
            journal: JournalName::parse(journal).expect("valid journal name"),
            offset: 0,
            header: None,
            do_not_proxy: false,
        }));
        for chunk in chunks {
            client.send(&Message::AppendChunk(AppendChunk {
                content: Bytes::copy_from_slice(chunk),
            }));
        }
        client.send(&Message::AppendChunk(AppendChunk {
            content: Bytes::new(),
        }));
        client.finish_sending();

        match client.recv() {
            Some(Message::AppendResp(resp)) => resp,
            other => panic!("expected AppendResp, got {other:?}"),
        }
    }

    /// Open a read stream.
    pub fn read(addr: &str, limits: Limits, req: ReadReq) -> Self {
        let mut client = Self::connect(addr, limits);
        client.send(&Message::ReadReq(req));
        client
    }

    /// The next read frame, if the stream is still open.
    pub fn next_read(&mut self) -> Option<crate::broker::proto::ReadResp> {
        match self.recv() {
            Some(Message::ReadResp(resp)) => Some(resp),
            None => None,
            other => panic!("expected ReadResp, got {other:?}"),
        }
    }
}

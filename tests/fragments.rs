//! Fragment persistence and store-resident read behavior.

use std::time::{Duration, Instant};

use plume::broker::proto::{ReadReq, Status};
use plume::core::{CompressionCodec, Fragment, JournalName, Sha1Sum};
use plume::store::FragmentStore;
use plume::test_support::{TestCluster, TestClusterOptions};

fn journal(name: &str) -> JournalName {
    JournalName::parse(name).unwrap()
}

fn offloaded() -> TestClusterOptions {
    let mut options = TestClusterOptions::default();
    options.offload_fragments = true;
    options
}

fn read_req(name: &str, offset: u64) -> ReadReq {
    ReadReq {
        journal: journal(name),
        offset,
        block: false,
        do_not_proxy: false,
        metadata_only: false,
        header: None,
    }
}

#[test]
fn rotated_fragments_reach_the_store() {
    let cluster = TestCluster::start_with(&["local#broker"], offloaded());

    // A tiny length target forces rotation ahead of the second append.
    let mut spec = plume::core::JournalSpec::new(journal("a/journal"));
    spec.fragment.max_length_bytes = 8;
    spec.fragment.stores = vec![cluster.store.root().to_string()];
    cluster.create_journal_from_spec(&spec, &["local#broker"]);

    let resp = cluster.append("local#broker", "a/journal", &[b"foobarbaz"]);
    assert_eq!(resp.status, Status::Ok);

    // The second append rolls the oversized open fragment, which queues
    // its persistence.
    let resp = cluster.append("local#broker", "a/journal", &[b"bing"]);
    assert_eq!(resp.status, Status::Ok);
    let commit = resp.commit.expect("commit fragment");
    assert_eq!((commit.begin, commit.end), (9, 13));

    let deadline = Instant::now() + Duration::from_secs(5);
    let listed = loop {
        let listed = cluster.store.list(&journal("a/journal")).unwrap();
        if !listed.is_empty() {
            break listed;
        }
        assert!(Instant::now() < deadline, "fragment never persisted");
        std::thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(listed.len(), 1);
    assert_eq!((listed[0].begin, listed[0].end), (0, 9));
    assert_eq!(listed[0].sum, Sha1Sum::of(b"foobarbaz"));

    // Reads now carry the fragment's store URL.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let mut reader = cluster.read("local#broker", read_req("a/journal", 0));
        let meta = reader.next_read().expect("metadata frame");
        if meta.fragment_url.is_some() {
            let url = meta.fragment_url.unwrap();
            assert!(url.starts_with("file://"));
            assert!(url.contains("a/journal"));
            break;
        }
        assert!(Instant::now() < deadline, "fragment_url never appeared");
        std::thread::sleep(Duration::from_millis(20));
    }

    cluster.shutdown();
}

#[test]
fn store_resident_fragments_serve_reads() {
    let cluster = TestCluster::start_with(&["local#broker"], offloaded());

    // Persist a fixture before the journal exists, so the replica's first
    // store scan surfaces it.
    const DATA: &[u8] = b"XXXXXremote fragment data";
    let fixture = Fragment {
        journal: journal("b/journal"),
        begin: 95,
        end: 120,
        sum: Sha1Sum::of(DATA),
        codec: CompressionCodec::None,
        backing_store: None,
        mod_time_ms: 0,
    };
    cluster.store.persist(&fixture, DATA).unwrap();
    cluster.create_journal("b/journal", &["local#broker"]);

    let mut reader = cluster.read("local#broker", read_req("b/journal", 100));
    let meta = reader.next_read().expect("metadata frame");
    assert_eq!(meta.status, Status::Ok);
    assert_eq!(meta.offset, 100);
    assert_eq!(meta.write_head, 120);
    let fragment = meta.fragment.expect("fragment");
    assert_eq!((fragment.begin, fragment.end), (95, 120));
    let url = meta.fragment_url.expect("fragment url");
    assert!(url.ends_with(&fixture.content_path()));

    let content = reader.next_read().expect("content frame");
    assert_eq!(content.offset, 100);
    assert_eq!(content.content.as_ref(), b"remote fragment data");

    let tail = reader.next_read().expect("tail frame");
    assert_eq!(tail.status, Status::OffsetNotYetAvailable);
    assert_eq!(tail.write_head, 120);

    // A reader that refuses proxying gets metadata and the URL only.
    let mut req = read_req("b/journal", 100);
    req.do_not_proxy = true;
    let mut reader = cluster.read("local#broker", req);
    let meta = reader.next_read().expect("metadata frame");
    assert!(meta.fragment_url.is_some());
    assert!(reader.next_read().is_none());

    cluster.shutdown();
}

#[test]
fn index_head_guards_appends_after_recovery() {
    let cluster = TestCluster::start_with(&["local#broker"], offloaded());

    const DATA: &[u8] = b"recovered";
    let fixture = Fragment {
        journal: journal("c/journal"),
        begin: 0,
        end: DATA.len() as u64,
        sum: Sha1Sum::of(DATA),
        codec: CompressionCodec::None,
        backing_store: None,
        mod_time_ms: 0,
    };
    cluster.store.persist(&fixture, DATA).unwrap();
    cluster.create_journal("c/journal", &["local#broker"]);

    // The spool opens at zero but the index knows better: an offset-less
    // append is refused rather than double-writing the range.
    let resp = cluster.append("local#broker", "c/journal", &[b"x"]);
    assert_eq!(resp.status, Status::IndexHasGreaterOffset);

    // An operator append at the explicit head re-syncs and lands.
    use bytes::Bytes;
    use plume::broker::proto::{AppendChunk, AppendReq, Message};
    let mut client = cluster.client("local#broker");
    client.send(&Message::AppendReq(AppendReq {
        journal: journal("c/journal"),
        offset: 9,
        header: None,
        do_not_proxy: true,
    }));
    client.send(&Message::AppendChunk(AppendChunk {
        content: Bytes::from_static(b"!"),
    }));
    client.send(&Message::AppendChunk(AppendChunk {
        content: Bytes::new(),
    }));
    client.finish_sending();
    match client.recv() {
        Some(Message::AppendResp(resp)) => {
            assert_eq!(resp.status, Status::Ok);
            assert_eq!((resp.commit.as_ref().unwrap().begin, resp.commit.as_ref().unwrap().end), (9, 10));
        }
        other => panic!("expected AppendResp, got {other:?}"),
    }

    cluster.shutdown();
}

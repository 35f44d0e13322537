//! End-to-end broker scenarios over real TCP connections.

use std::thread;
use std::time::Duration;

use bytes::Bytes;

use plume::broker::proto::{AppendChunk, AppendReq, Message, ReadReq, Status};
use plume::coord::CoordStore;
use plume::core::{AccessMode, JournalName, Sha1Sum};
use plume::test_support::{TestCluster, TestClusterOptions};

fn journal(name: &str) -> JournalName {
    JournalName::parse(name).unwrap()
}

fn read_req(name: &str, offset: u64, block: bool) -> ReadReq {
    ReadReq {
        journal: journal(name),
        offset,
        block,
        do_not_proxy: false,
        metadata_only: false,
        header: None,
    }
}

#[test]
fn single_primary_append_and_read() {
    let cluster = TestCluster::start(&["local#broker"]);
    cluster.create_journal("a/journal", &["local#broker"]);

    let resp = cluster.append("local#broker", "a/journal", &[b"foobarbaz"]);
    assert_eq!(resp.status, Status::Ok);
    let commit = resp.commit.expect("commit fragment");
    assert_eq!((commit.begin, commit.end), (0, 9));
    assert_eq!(commit.sum, Sha1Sum::of(b"foobarbaz"));
    assert_eq!(resp.registered_length, 9);

    let mut reader = cluster.read("local#broker", read_req("a/journal", 0, false));
    let meta = reader.next_read().expect("metadata frame");
    assert_eq!(meta.status, Status::Ok);
    assert!(meta.header.is_some());
    assert_eq!(meta.offset, 0);
    assert_eq!(meta.write_head, 9);
    let fragment = meta.fragment.expect("fragment");
    assert_eq!((fragment.begin, fragment.end), (0, 9));
    assert_eq!(fragment.sum, Sha1Sum::of(b"foobarbaz"));

    let content = reader.next_read().expect("content frame");
    assert_eq!(content.offset, 0);
    assert_eq!(content.content.as_ref(), b"foobarbaz");

    let tail = reader.next_read().expect("tail frame");
    assert_eq!(tail.status, Status::OffsetNotYetAvailable);
    assert_eq!(tail.offset, 9);
    assert_eq!(tail.write_head, 9);
    assert!(reader.next_read().is_none());

    cluster.shutdown();
}

#[test]
fn blocking_read_unblocked_by_append() {
    let cluster = TestCluster::start(&["local#broker"]);
    cluster.create_journal("a/journal", &["local#broker"]);
    cluster.append("local#broker", "a/journal", &[b"foobarbaz"]);

    let mut reader = cluster.read("local#broker", read_req("a/journal", 9, true));
    // Give the read time to park at the write head.
    thread::sleep(Duration::from_millis(50));

    let resp = cluster.append("local#broker", "a/journal", &[b"bing"]);
    assert_eq!(resp.status, Status::Ok);

    let meta = reader.next_read().expect("metadata frame");
    assert_eq!(meta.status, Status::Ok);
    assert!(meta.header.is_some());
    assert_eq!(meta.offset, 9);
    assert_eq!(meta.write_head, 13);
    let fragment = meta.fragment.expect("fragment");
    assert_eq!((fragment.begin, fragment.end), (0, 13));
    assert_eq!(fragment.sum, Sha1Sum::of(b"foobarbazbing"));

    let content = reader.next_read().expect("content frame");
    assert_eq!(content.offset, 9);
    assert_eq!(content.content.as_ref(), b"bing");

    cluster.shutdown();
}

#[test]
fn chunked_read_streaming() {
    let mut options = TestClusterOptions::default();
    options.limits.read_chunk_bytes = 5;
    let cluster = TestCluster::start_with(&["local#broker"], options);
    cluster.create_journal("a/journal", &["local#broker"]);
    cluster.append("local#broker", "a/journal", &[b"foobarbaz"]);

    let mut reader = cluster.read("local#broker", read_req("a/journal", 0, true));

    let meta = reader.next_read().expect("metadata frame");
    assert_eq!(
        (meta.fragment.as_ref().unwrap().begin, meta.fragment.as_ref().unwrap().end),
        (0, 9)
    );

    let first = reader.next_read().expect("first chunk");
    assert_eq!(first.offset, 0);
    assert_eq!(first.content.as_ref(), b"fooba");
    let second = reader.next_read().expect("second chunk");
    assert_eq!(second.offset, 5);
    assert_eq!(second.content.as_ref(), b"rbaz");

    cluster.append("local#broker", "a/journal", &[b"bing"]);

    let meta = reader.next_read().expect("new fragment frame");
    assert!(meta.header.is_none());
    let fragment = meta.fragment.expect("fragment");
    assert_eq!((fragment.begin, fragment.end), (0, 13));
    let content = reader.next_read().expect("content frame");
    assert_eq!(content.offset, 9);
    assert_eq!(content.content.as_ref(), b"bing");

    cluster.shutdown();
}

#[test]
fn sync_rolls_forward_to_furthest_peer() {
    let cluster = TestCluster::start(&["local#broker", "peer#broker"]);
    cluster.create_journal("a/journal", &["local#broker", "peer#broker"]);

    cluster.roll_spool("local#broker", "a/journal", 30);
    cluster.roll_spool("peer#broker", "a/journal", 50);

    let resp = cluster.append("local#broker", "a/journal", &[b"hello"]);
    assert_eq!(resp.status, Status::Ok);
    let commit = resp.commit.expect("commit fragment");
    assert_eq!((commit.begin, commit.end), (50, 55));
    assert_eq!(commit.sum, Sha1Sum::of(b"hello"));

    // Both brokers observe the committed extent at the rolled offset.
    for broker in ["local#broker", "peer#broker"] {
        let mut req = read_req("a/journal", 50, false);
        req.do_not_proxy = true;
        let mut reader = cluster.read(broker, req);
        let meta = reader.next_read().expect("metadata frame");
        assert_eq!(meta.status, Status::Ok, "broker {broker}");
        assert_eq!(meta.write_head, 55);
        let fragment = meta.fragment.expect("fragment");
        assert_eq!((fragment.begin, fragment.end), (50, 55));
        let content = reader.next_read().expect("content frame");
        assert_eq!(content.content.as_ref(), b"hello");
    }

    cluster.shutdown();
}

#[test]
fn stale_assignments_are_reconciled_before_commit() {
    use plume::coord::keys;
    use plume::core::{ProcessId, Route};

    let cluster = TestCluster::start(&["local#broker", "peer#broker"]);

    // Create the journal with the live route, then regress the peer's
    // advertised assignment to a stale, single-member route.
    cluster.create_journal("a/journal", &["local#broker", "peer#broker"]);
    let stale = Route {
        members: vec![ProcessId::parse("local#broker").unwrap()],
        primary: Some(0),
    };
    let revision = keys::assign(
        cluster.coord.as_ref(),
        "/plume",
        &journal("a/journal"),
        &ProcessId::parse("peer#broker").unwrap(),
        1,
        &stale,
        None,
    )
    .unwrap();
    cluster.wait_revision(revision);

    let resp = cluster.append("local#broker", "a/journal", &[b"foobarbaz"]);
    assert_eq!(resp.status, Status::Ok);

    // The append's reconciliation rewrote the stale advertisement.
    let (_, kvs) = cluster.coord.snapshot("/plume/assign/");
    for kv in &kvs {
        let assignment = keys::parse_assignment("/plume", kv).expect("assignment parses");
        assert_eq!(assignment.advertised.members.len(), 2, "stale advertisement survived");
    }

    cluster.shutdown();
}

#[test]
fn stalled_append_rolls_back_and_journal_recovers() {
    let cluster = TestCluster::start(&["local#broker"]);
    cluster.create_journal("a/journal", &["local#broker"]);

    let mut stalled = cluster.client("local#broker");
    stalled.send(&Message::AppendReq(AppendReq {
        journal: journal("a/journal"),
        offset: 0,
        header: None,
        do_not_proxy: true,
    }));
    stalled.send(&Message::AppendChunk(AppendChunk {
        content: Bytes::from_static(b"hello"),
    }));
    // Stall past two chunk budgets; the broker rolls the append back and
    // closes the stream without a response.
    assert!(stalled.recv().is_none());

    // The journal is healthy and starts where it did before.
    let resp = cluster.append("local#broker", "a/journal", &[b"foobarbaz"]);
    assert_eq!(resp.status, Status::Ok);
    let commit = resp.commit.expect("commit fragment");
    assert_eq!((commit.begin, commit.end), (0, 9));

    cluster.shutdown();
}

#[test]
fn replicated_append_serves_reads_from_both_members() {
    let cluster = TestCluster::start(&["local#broker", "peer#broker"]);
    cluster.create_journal("a/journal", &["local#broker", "peer#broker"]);

    let resp = cluster.append("local#broker", "a/journal", &[b"foobarbaz"]);
    assert_eq!(resp.status, Status::Ok);

    for broker in ["local#broker", "peer#broker"] {
        let mut req = read_req("a/journal", 0, false);
        req.do_not_proxy = true;
        let mut reader = cluster.read(broker, req);
        let meta = reader.next_read().expect("metadata frame");
        assert_eq!(meta.status, Status::Ok, "broker {broker}");
        let fragment = meta.fragment.expect("fragment");
        assert_eq!((fragment.begin, fragment.end), (0, 9));
        assert_eq!(fragment.sum, Sha1Sum::of(b"foobarbaz"));
        let content = reader.next_read().expect("content frame");
        assert_eq!(content.content.as_ref(), b"foobarbaz");
    }

    cluster.shutdown();
}

#[test]
fn appends_proxy_to_the_primary() {
    let cluster = TestCluster::start(&["local#broker", "peer#broker"]);
    cluster.create_journal("a/journal", &["peer#broker"]);

    // Append via the non-member broker; it forwards to the primary.
    let resp = cluster.append("local#broker", "a/journal", &[b"foobarbaz"]);
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.header.process_id.to_string(), "peer#broker");
    let commit = resp.commit.expect("commit fragment");
    assert_eq!((commit.begin, commit.end), (0, 9));

    // Reads proxy too.
    let mut reader = cluster.read("local#broker", read_req("a/journal", 0, false));
    let meta = reader.next_read().expect("metadata frame");
    assert_eq!(meta.status, Status::Ok);
    let content = reader.next_read().expect("content frame");
    assert_eq!(content.content.as_ref(), b"foobarbaz");

    cluster.shutdown();
}

#[test]
fn do_not_proxy_refusals() {
    let cluster = TestCluster::start(&["local#broker", "peer#broker"]);
    cluster.create_journal("a/journal", &["peer#broker"]);

    let mut client = cluster.client("local#broker");
    client.send(&Message::AppendReq(AppendReq {
        journal: journal("a/journal"),
        offset: 0,
        header: None,
        do_not_proxy: true,
    }));
    client.finish_sending();
    match client.recv() {
        Some(Message::AppendResp(resp)) => {
            assert_eq!(resp.status, Status::NotJournalPrimaryBroker);
        }
        other => panic!("expected AppendResp, got {other:?}"),
    }

    let mut req = read_req("a/journal", 0, false);
    req.do_not_proxy = true;
    let mut reader = cluster.read("local#broker", req);
    let resp = reader.next_read().expect("refusal frame");
    assert_eq!(resp.status, Status::NotJournalBroker);

    cluster.shutdown();
}

#[test]
fn journal_access_flags_are_enforced() {
    let cluster = TestCluster::start(&["local#broker"]);
    cluster.create_journal_with("write/only", &["local#broker"], AccessMode::WriteOnly);
    cluster.create_journal_with("read/only", &["local#broker"], AccessMode::ReadOnly);

    let mut reader = cluster.read("local#broker", read_req("write/only", 0, false));
    let resp = reader.next_read().expect("refusal frame");
    assert_eq!(resp.status, Status::NotAllowed);
    assert!(resp.header.is_some());

    let resp = cluster.append("local#broker", "read/only", &[b"nope"]);
    assert_eq!(resp.status, Status::NotAllowed);
    assert!(resp.commit.is_none());

    cluster.shutdown();
}

#[test]
fn missing_and_underreplicated_journals_are_refused() {
    let cluster = TestCluster::start(&["local#broker"]);

    let resp = cluster.append("local#broker", "no/such/journal", &[b"x"]);
    assert_eq!(resp.status, Status::JournalNotFound);

    // Desired replication 2, one live member.
    use plume::coord::keys;
    use plume::core::{JournalSpec, ProcessId, Route};
    let mut spec = JournalSpec::new(journal("a/under"));
    spec.replication = 2;
    keys::create_journal(cluster.coord.as_ref(), "/plume", &spec).unwrap();
    let route = Route {
        members: vec![ProcessId::parse("local#broker").unwrap()],
        primary: Some(0),
    };
    let revision = keys::assign(
        cluster.coord.as_ref(),
        "/plume",
        &journal("a/under"),
        &ProcessId::parse("local#broker").unwrap(),
        0,
        &route,
        None,
    )
    .unwrap();
    cluster.wait_revision(revision);

    let resp = cluster.append("local#broker", "a/under", &[b"x"]);
    assert_eq!(resp.status, Status::InsufficientJournalBrokers);

    cluster.shutdown();
}

#[test]
fn concurrent_appends_commit_in_a_total_order() {
    let cluster = TestCluster::start(&["local#broker", "peer#broker"]);
    cluster.create_journal("a/journal", &["local#broker", "peer#broker"]);

    let addr = cluster.broker("local#broker").local_addr().to_string();
    let limits = cluster.limits();

    let mut joins = Vec::new();
    for i in 0..8u8 {
        let addr = addr.clone();
        let limits = limits.clone();
        joins.push(thread::spawn(move || {
            let payload = vec![b'a' + i; 16];
            let resp = plume::test_support::TestClient::append(
                &addr,
                limits,
                "a/journal",
                &[&payload],
            );
            assert_eq!(resp.status, Status::Ok);
            resp.commit.expect("commit fragment")
        }));
    }
    let mut commits: Vec<_> = joins.into_iter().map(|j| j.join().unwrap()).collect();
    commits.sort_by_key(|c| c.begin);

    // Commits tile the journal without gaps or overlap.
    let mut expected_begin = 0;
    for commit in &commits {
        assert_eq!(commit.begin, expected_begin);
        assert_eq!(commit.len(), 16);
        expected_begin = commit.end;
    }
    assert_eq!(expected_begin, 8 * 16);

    // The full byte range reads back as contiguous content.
    let mut reader = cluster.read("local#broker", read_req("a/journal", 0, false));
    let meta = reader.next_read().expect("metadata frame");
    assert_eq!(meta.write_head, 8 * 16);
    let mut content = Vec::new();
    loop {
        let Some(resp) = reader.next_read() else { break };
        if resp.status != Status::Ok {
            break;
        }
        content.extend_from_slice(&resp.content);
    }
    assert_eq!(content.len(), 8 * 16 as usize);

    cluster.shutdown();
}

#[test]
fn explicit_offset_appends() {
    let cluster = TestCluster::start(&["local#broker"]);
    cluster.create_journal("a/journal", &["local#broker"]);
    cluster.append("local#broker", "a/journal", &[b"foobarbaz"]);

    // A wrong explicit offset is refused.
    let mut client = cluster.client("local#broker");
    client.send(&Message::AppendReq(AppendReq {
        journal: journal("a/journal"),
        offset: 4,
        header: None,
        do_not_proxy: true,
    }));
    client.send(&Message::AppendChunk(AppendChunk {
        content: Bytes::from_static(b"x"),
    }));
    client.send(&Message::AppendChunk(AppendChunk {
        content: Bytes::new(),
    }));
    client.finish_sending();
    match client.recv() {
        Some(Message::AppendResp(resp)) => {
            assert_eq!(resp.status, Status::WrongAppendOffset)
        }
        other => panic!("expected AppendResp, got {other:?}"),
    }

    // The current head as an explicit offset is accepted.
    let mut client = cluster.client("local#broker");
    client.send(&Message::AppendReq(AppendReq {
        journal: journal("a/journal"),
        offset: 9,
        header: None,
        do_not_proxy: true,
    }));
    client.send(&Message::AppendChunk(AppendChunk {
        content: Bytes::from_static(b"bing"),
    }));
    client.send(&Message::AppendChunk(AppendChunk {
        content: Bytes::new(),
    }));
    client.finish_sending();
    match client.recv() {
        Some(Message::AppendResp(resp)) => {
            assert_eq!(resp.status, Status::Ok);
            assert_eq!(resp.commit.unwrap().end, 13);
        }
        other => panic!("expected AppendResp, got {other:?}"),
    }

    cluster.shutdown();
}

//! Whole-cluster integration tests: full servers wired over the
//! in-memory mesh, covering bootstrap, slot replication, channel lazy
//! load, channel elections and seed-based joining.

use parking_lot::Mutex;
use rookery::config::Options;
use rookery::hooks::ServerHooks;
use rookery::replica::{LogEntry, MessageType, ShardMessage};
use rookery::server::ClusterServer;
use rookery::transport::memory::MemoryMesh;
use rookery::types::{slot_for_key, ChannelKey, LogIndex, NodeId};
use rookery::RookeryError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct TestNode {
    server: Arc<ClusterServer>,
    applied: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    _dir: TempDir,
}

fn cluster_addr(id: NodeId) -> String {
    format!("n{}:11110", id)
}

async fn start_node(
    mesh: &MemoryMesh,
    id: NodeId,
    init: &[NodeId],
    seed: &str,
    slot_count: u32,
) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let init_nodes: HashMap<NodeId, String> =
        init.iter().map(|id| (*id, cluster_addr(*id))).collect();
    let opts = Options {
        node_id: id,
        addr: cluster_addr(id),
        server_addr: format!("n{}:5001", id),
        seed: seed.to_string(),
        init_nodes,
        slot_count,
        slot_max_replica_count: 3,
        channel_max_replica_count: 3,
        check_interval: Duration::from_millis(30),
        propose_timeout: Duration::from_secs(3),
        req_timeout: Duration::from_secs(3),
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };

    let applied: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&applied);
    let hooks = ServerHooks {
        on_apply: Some(Arc::new(move |shard: &str, entries: &[LogEntry]| {
            let mut sink = sink.lock();
            for entry in entries {
                sink.push((shard.to_string(), entry.data_bytes().to_vec()));
            }
            Ok(entries.last().map(|e| e.index).unwrap_or(0))
        })),
        ..Default::default()
    };

    let net_server = mesh.server(&opts.addr);
    let server = ClusterServer::new(opts, net_server, mesh.connector(), hooks).unwrap();
    server.start().await.unwrap();
    TestNode {
        server,
        applied,
        _dir: dir,
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, cond: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Retry an async op until it succeeds or the deadline passes.
async fn eventually<T, Fut, F>(what: &str, timeout: Duration, op: F) -> T
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, RookeryError>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match op().await {
            Ok(value) => return value,
            Err(e) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "timed out waiting for {}: last error {}",
                    what,
                    e
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

#[tokio::test]
async fn single_node_bootstrap() {
    let mesh = MemoryMesh::new();
    let node = start_node(&mesh, 1, &[], "", 4).await;

    // No seed, no init nodes: prepared immediately.
    assert!(node.server.is_prepared());

    // Every slot is hosted locally and accepts proposes.
    let index = eventually("slot propose", Duration::from_secs(5), || {
        node.server.propose_to_slot(0, b"hello".to_vec())
    })
    .await;
    assert_eq!(index, 1);

    wait_until("slot apply", Duration::from_secs(5), || {
        node.applied
            .lock()
            .iter()
            .any(|(shard, data)| shard == "0" && data == b"hello")
    })
    .await;

    node.server.stop().await;
}

#[tokio::test]
async fn single_node_channel_lifecycle() {
    let mesh = MemoryMesh::new();
    let node = start_node(&mesh, 1, &[], "", 4).await;

    let key = ChannelKey::new("room-42", 1);
    // Unknown channel before any load.
    let err = node
        .server
        .propose_to_channel(&key, b"hi".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, RookeryError::ChannelNotFound(_)));

    let replica = node
        .server
        .load_or_create_channel(key.clone())
        .await
        .unwrap();
    assert_eq!(replica.shard(), key.handler_key());

    // The election elects the only member; propose succeeds once it does.
    let index = eventually("channel propose", Duration::from_secs(5), || {
        node.server.propose_to_channel(&key, b"first".to_vec())
    })
    .await;
    assert_eq!(index, 1);

    wait_until("channel apply", Duration::from_secs(5), || {
        node.applied
            .lock()
            .iter()
            .any(|(shard, data)| shard == key.handler_key() && data == b"first")
    })
    .await;

    node.server.stop().await;
}

#[tokio::test]
async fn channel_lazy_load_from_inbound_frame() {
    let mesh = MemoryMesh::new();
    let node = start_node(&mesh, 1, &[], "", 4).await;

    let key = ChannelKey::new("room-7", 2);
    let frame = ShardMessage {
        handler_key: key.handler_key(),
        from: 1,
        to: 1,
        msg_type: MessageType::Heartbeat,
        term: 0,
        index: 0,
        commit: 0,
        entries: vec![],
        sync_info: None,
        reject: false,
    };

    // First frame triggers the load; the frame itself is dropped.
    node.server.add_channel_message(frame.clone()).await.unwrap();
    // A racing second first-frame observes the loading mark or the
    // already-registered replica; either way it must not fail.
    node.server.add_channel_message(frame.clone()).await.unwrap();

    // The load registers the replica and the election installs a leader.
    let _ = eventually("lazy channel propose", Duration::from_secs(5), || {
        node.server.propose_to_channel(&key, b"lazy".to_vec())
    })
    .await;

    // Subsequent frames enqueue directly (no error, no reload).
    node.server.add_channel_message(frame).await.unwrap();

    node.server.stop().await;
}

#[tokio::test]
async fn three_node_slot_replication() {
    let mesh = MemoryMesh::new();
    let ids = [1u64, 2, 3];
    let mut nodes = Vec::new();
    for id in ids {
        nodes.push(start_node(&mesh, id, &ids, "", 4).await);
    }
    for node in &nodes {
        assert!(node.server.is_prepared());
    }

    // Slot 0's bootstrap leader is node 1 (deterministic assignment).
    let payload = b"replicated".to_vec();
    let index = eventually("slot propose", Duration::from_secs(10), || {
        nodes[0].server.propose_to_slot(0, payload.clone())
    })
    .await;
    assert_eq!(index, 1);

    // The entry applies on every replica of slot 0.
    for node in &nodes {
        wait_until("replicated apply", Duration::from_secs(10), || {
            node.applied
                .lock()
                .iter()
                .any(|(shard, data)| shard == "0" && data == &payload)
        })
        .await;
    }

    // A non-leader slot node refuses the propose with a leader hint.
    let err = nodes[1]
        .server
        .propose_to_slot(0, b"nope".to_vec())
        .await
        .unwrap_err();
    match err {
        RookeryError::NotLeader { leader } => assert_eq!(leader, Some(1)),
        RookeryError::ProposeTimeout => {}
        other => panic!("unexpected error: {other}"),
    }

    for node in &nodes {
        node.server.stop().await;
    }
}

#[tokio::test]
async fn three_node_channel_election() {
    let mesh = MemoryMesh::new();
    let ids = [1u64, 2, 3];
    let mut nodes = Vec::new();
    for id in ids {
        nodes.push(start_node(&mesh, id, &ids, "", 4).await);
    }

    let key = ChannelKey::new("lobby", 1);
    let owning_slot = slot_for_key(&key.channel_id, 4);

    // Load from a node that may or may not lead the owning slot; the
    // metadata resolves locally or over RPC either way.
    let replica = eventually("channel load", Duration::from_secs(10), || {
        nodes[0].server.load_or_create_channel(key.clone())
    })
    .await;

    // The election settles on one member; empty logs tie-break by id.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let leader = loop {
        let status = replica.status().await.unwrap();
        if status.leader != 0 {
            break status.leader;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "channel election did not settle"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert!(ids.contains(&leader));

    // Load on the elected leader's node and publish through it.
    let leader_node = nodes.iter().find(|n| n.server.node_id() == leader).unwrap();
    let _ = eventually("leader-side load", Duration::from_secs(10), || {
        leader_node.server.load_or_create_channel(key.clone())
    })
    .await;
    let index: LogIndex = eventually("channel publish", Duration::from_secs(10), || {
        leader_node.server.propose_to_channel(&key, b"welcome".to_vec())
    })
    .await;
    assert!(index >= 1);
    assert!(owning_slot < 4);

    for node in &nodes {
        node.server.stop().await;
    }
}

#[tokio::test]
async fn join_via_seed() {
    let mesh = MemoryMesh::new();
    let ids = [1u64, 2, 3];
    let mut nodes = Vec::new();
    for id in ids {
        nodes.push(start_node(&mesh, id, &ids, "", 4).await);
    }

    // Give the config shard a moment to elect a leader, then join.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let joiner = start_node(&mesh, 4, &[], "1@n1:11110", 4).await;
    assert!(!joiner.server.is_prepared(), "joiner starts unprepared");

    // The join loop retries every two seconds.
    wait_until("join to prepare", Duration::from_secs(8), || {
        joiner.server.is_prepared()
    })
    .await;

    // The seed cluster commits the new member.
    wait_until("member committed", Duration::from_secs(10), || {
        nodes[0].server.event_server().node(4).is_some()
    })
    .await;

    // The config log syncs to the joiner, which learns the full roster.
    wait_until("joiner config sync", Duration::from_secs(15), || {
        let known = joiner.server.event_server().nodes();
        [1u64, 2, 3, 4]
            .iter()
            .all(|id| known.iter().any(|n| n.id == *id))
    })
    .await;

    joiner.server.stop().await;
    for node in &nodes {
        node.server.stop().await;
    }
}

//! Log compaction, snapshot install and restart

mod common;

use common::{fast_client_config, fast_server_config, wait_until, SETTLE};
use shardkv::common::{ServerConfig, N_SHARDS};
use shardkv::consensus::MemoryGroup;
use shardkv::server::{ReplicaSetup, ShardKv};
use shardkv::shardctrler::MemoryAuthority;
use shardkv::transport::LocalNetwork;
use shardkv::{Cluster, Error};
use std::sync::Arc;

fn compacting_cluster() -> Cluster {
    let config = ServerConfig {
        max_raft_state: Some(1_000),
        ..fast_server_config()
    };
    Cluster::new(config, fast_client_config())
}

async fn caught_up(cluster: &Cluster, gid: u64, me: usize, index: u64) -> bool {
    let Some(kv) = cluster.server(gid, me) else {
        return false;
    };
    wait_until(SETTLE, || {
        let kv = kv.clone();
        async move { kv.read(|sm| sm.last_applied()) >= index }
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_log_compacted_and_restart_restores_state() {
    let cluster = compacting_cluster();
    cluster.add_group(1, 3).unwrap();
    let num = cluster.join(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    let clerk = cluster.clerk().await.unwrap();
    let mut expected = String::new();
    for i in 0..60 {
        let token = format!("[{:03}]", i);
        clerk.append("k", &token).await;
        expected.push_str(&token);
    }

    let log = cluster.log(1).unwrap();
    assert!(log.first_index() > 1, "log was never compacted");
    assert!(log.persisted_snapshot(0).is_some());

    // A replica that misses compacted entries is brought back by snapshot.
    cluster.crash(1, 2);
    for i in 60..90 {
        let token = format!("[{:03}]", i);
        clerk.append("k", &token).await;
        expected.push_str(&token);
    }
    cluster.restart(1, 2).unwrap();
    let last = log.last_index();
    assert!(caught_up(&cluster, 1, 2, last).await);

    let leader_image = cluster.server(1, 0).unwrap().read(|sm| sm.image());
    let restarted_image = cluster.server(1, 2).unwrap().read(|sm| sm.image());
    assert_eq!(leader_image, restarted_image);

    // The whole group restarts from persisted snapshots plus the log tail.
    for me in 0..3 {
        cluster.crash(1, me);
    }
    for me in 0..3 {
        cluster.restart(1, me).unwrap();
    }
    for me in 0..3 {
        assert!(caught_up(&cluster, 1, me, last).await);
    }
    cluster.set_leader(1, Some(2)).unwrap();
    assert_eq!(clerk.get("k").await, Some(expected));
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_keeps_duplicate_suppression() {
    let cluster = compacting_cluster();
    cluster.add_group(1, 1).unwrap();
    let num = cluster.join(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    let clerk = cluster.clerk().await.unwrap();
    for i in 0..40 {
        clerk.put(&format!("key{}", i % N_SHARDS), &i.to_string()).await;
    }
    let sessions = cluster.server(1, 0).unwrap().read(|sm| sm.sessions().clone());

    cluster.crash(1, 0);
    cluster.restart(1, 0).unwrap();
    let last = cluster.log(1).unwrap().last_index();
    assert!(caught_up(&cluster, 1, 0, last).await);

    let kv = cluster.server(1, 0).unwrap();
    assert_eq!(kv.read(|sm| sm.sessions().clone()), sessions);
    assert_eq!(kv.read(|sm| sm.current().num), num);
    assert_eq!(clerk.get("key3").await.as_deref(), Some("33"));
    cluster.shutdown();
}

#[tokio::test]
async fn test_corrupt_snapshot_refuses_to_start() {
    let log = MemoryGroup::new(1);
    let setup = ReplicaSetup {
        gid: 1,
        me: 0,
        config: fast_server_config(),
        consensus: Arc::new(log.replica(0)),
        authority: Arc::new(MemoryAuthority::new()),
        transport: LocalNetwork::new(),
    };
    let result = ShardKv::start(setup, log.attach(0), Some(b"SKV1garbage".as_slice()));
    assert!(matches!(result, Err(Error::SnapshotCorrupted(_))));
}

//! Shard migration between groups

mod common;

use common::{cluster, get_args, key_in_shard, wait_until, SETTLE};
use shardkv::common::N_SHARDS;
use shardkv::server::{PutAppendArgs, PutAppendOp, RequestId, ShardState, Status};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shard_moves_with_data_and_sessions() {
    let cluster = cluster();
    cluster.add_group(1, 3).unwrap();
    cluster.add_group(2, 3).unwrap();
    let num = cluster.join(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    let g1 = cluster.server(1, 0).unwrap();
    let put = PutAppendArgs {
        key: "a".into(),
        value: "1".into(),
        op: PutAppendOp::Put,
        request: RequestId { client_id: 99, seq: 1 },
    };
    assert_eq!(g1.put_append(put.clone()).await.status, Status::Ok);

    cluster.join(&[2]).unwrap();
    let shard = shardkv::common::shard_for_key("a");
    let num = cluster.move_shard(shard, 2).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    // G1 gave the shard up but keeps the content for the new owner.
    let reply = g1.get(get_args("a", 5, 1)).await;
    assert_eq!(reply.status, Status::WrongGroup);
    assert_eq!(g1.status().shards[shard].state, ShardState::PendingOutbound);

    let g2 = cluster.server(2, 0).unwrap();
    let status = g2.status();
    assert_eq!(status.shards[shard].state, ShardState::Ready);
    assert_eq!(status.shards[shard].version, num);
    assert_eq!(status.shards[shard].keys, 1);

    // The session migrated too: the old request is recognized at G2.
    assert_eq!(g2.put_append(put).await.status, Status::RepeatedRequest);

    let clerk = cluster.clerk().await.unwrap();
    assert_eq!(clerk.get("a").await.as_deref(), Some("1"));
    clerk.append("a", "2").await;
    assert_eq!(clerk.get("a").await.as_deref(), Some("12"));
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shard_not_ready_until_source_moves_on() {
    let cluster = cluster();
    cluster.add_group(1, 3).unwrap();
    cluster.add_group(2, 3).unwrap();
    let num = cluster.join(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    let clerk = cluster.clerk().await.unwrap();
    for shard in 0..N_SHARDS {
        let key = key_in_shard(shard);
        clerk.put(&key, &format!("v{}", shard)).await;
    }

    // Without a leader G1 cannot adopt the next configuration, so it never
    // releases the shards G2 is about to receive.
    cluster.set_leader(1, None).unwrap();
    let num = cluster.join(&[2]).unwrap();
    let moved = cluster.authority().latest().shards_of(2);
    assert!(!moved.is_empty());

    let g2 = cluster.server(2, 0).unwrap();
    let adopted = wait_until(SETTLE, || {
        let g2 = g2.clone();
        async move { g2.read(|sm| sm.current().num) == num }
    })
    .await;
    assert!(adopted);
    let key = key_in_shard(moved[0]);
    let reply = g2.get(get_args(&key, 8, 1)).await;
    assert_eq!(reply.status, Status::ShardNotReady);
    assert_eq!(g2.status().shards[moved[0]].state, ShardState::PendingInbound);
    assert!(g2.read(|sm| !sm.migrations_settled()));

    cluster.set_leader(1, Some(0)).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    for shard in 0..N_SHARDS {
        let key = key_in_shard(shard);
        assert_eq!(clerk.get(&key).await, Some(format!("v{}", shard)));
    }
    let reply = g2.get(get_args(&key, 8, 2)).await;
    assert_eq!(reply.status, Status::Ok);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leave_and_rejoin_preserves_data() {
    let cluster = cluster();
    for gid in 1..=3 {
        cluster.add_group(gid, 3).unwrap();
    }
    cluster.join(&[1]).unwrap();
    let num = cluster.join(&[2, 3]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    let clerk = cluster.clerk().await.unwrap();
    for shard in 0..N_SHARDS {
        clerk.put(&key_in_shard(shard), &shard.to_string()).await;
    }

    cluster.leave(&[1]).unwrap();
    let num = cluster.join(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    for shard in 0..N_SHARDS {
        let key = key_in_shard(shard);
        clerk.append(&key, "+").await;
        assert_eq!(clerk.get(&key).await, Some(format!("{}+", shard)));
    }

    let latest = cluster.authority().latest();
    for status in cluster.status() {
        for shard in &status.shards {
            let owned = latest.owns(status.gid, shard.shard);
            assert_eq!(owned, shard.state == ShardState::Ready);
        }
    }
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_group_leaves_then_rejoins() {
    let cluster = cluster();
    cluster.add_group(1, 3).unwrap();
    let num = cluster.join(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    let clerk = cluster.clerk().await.unwrap();
    for shard in 0..N_SHARDS {
        clerk.put(&key_in_shard(shard), &shard.to_string()).await;
    }

    let num = cluster.leave(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);
    let g1 = cluster.server(1, 0).unwrap();
    for shard in g1.status().shards {
        assert_eq!(shard.state, ShardState::PendingOutbound);
    }

    let num = cluster.join(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);
    for shard in 0..N_SHARDS {
        let key = key_in_shard(shard);
        assert_eq!(clerk.get(&key).await, Some(shard.to_string()));
    }
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_group_pulls_from_group_that_left() {
    let cluster = cluster();
    cluster.add_group(1, 3).unwrap();
    cluster.add_group(2, 3).unwrap();
    let num = cluster.join(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    let clerk = cluster.clerk().await.unwrap();
    for shard in 0..N_SHARDS {
        clerk.put(&key_in_shard(shard), &shard.to_string()).await;
    }

    let num = cluster.leave(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);
    let num = cluster.join(&[2]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    let g2 = cluster.server(2, 0).unwrap();
    for shard in g2.status().shards {
        assert_eq!(shard.state, ShardState::Ready);
        assert_eq!(shard.keys, 1);
    }
    for shard in 0..N_SHARDS {
        let key = key_in_shard(shard);
        clerk.append(&key, "+").await;
        assert_eq!(clerk.get(&key).await, Some(format!("{}+", shard)));
    }
    cluster.shutdown();
}

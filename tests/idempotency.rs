//! Duplicate suppression across client retries

mod common;

use common::{cluster, get_args, SETTLE};
use shardkv::server::{PutAppendArgs, PutAppendOp, RequestId, Status};

fn put_args(key: &str, value: &str, op: PutAppendOp, client_id: u64, seq: u64) -> PutAppendArgs {
    PutAppendArgs {
        key: key.to_string(),
        value: value.to_string(),
        op,
        request: RequestId { client_id, seq },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retried_put_applied_once() {
    let cluster = cluster();
    cluster.add_group(1, 3).unwrap();
    let num = cluster.join(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    let leader = cluster.server(1, 0).unwrap();
    let first = leader
        .put_append(put_args("a", "1", PutAppendOp::Put, 42, 1))
        .await;
    assert_eq!(first.status, Status::Ok);

    // Reply lost, client retries with the same sequence number.
    let retry = leader
        .put_append(put_args("a", "1", PutAppendOp::Put, 42, 1))
        .await;
    assert_eq!(retry.status, Status::RepeatedRequest);
    assert!(retry.status.is_success());

    let append = put_args("a", "x", PutAppendOp::Append, 42, 2);
    assert_eq!(leader.put_append(append.clone()).await.status, Status::Ok);
    assert_eq!(
        leader.put_append(append).await.status,
        Status::RepeatedRequest
    );

    let clerk = cluster.clerk().await.unwrap();
    assert_eq!(clerk.get("a").await.as_deref(), Some("1x"));

    let replies = futures_util::future::join_all(
        (0..3).map(|_| leader.get(get_args("a", 7, 1))),
    )
    .await;
    assert!(replies.iter().all(|r| r.value.as_deref() == Some("1x")));
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_followers_redirect_to_leader() {
    let cluster = cluster();
    cluster.add_group(1, 3).unwrap();
    let num = cluster.join(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    let follower = cluster.server(1, 1).unwrap();
    let reply = follower.get(get_args("a", 1, 1)).await;
    assert_eq!(reply.status, Status::WrongLeader);

    cluster.set_leader(1, Some(1)).unwrap();
    let reply = follower.get(get_args("a", 1, 2)).await;
    assert_eq!(reply.status, Status::NoKey);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_replies_do_not_duplicate_appends() {
    let cluster = cluster();
    cluster.add_group(1, 3).unwrap();
    let num = cluster.join(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    cluster.network().set_reply_loss(40);
    let clerk = cluster.clerk().await.unwrap();
    let mut expected = String::new();
    for i in 0..30 {
        let token = format!("{};", i);
        clerk.append("k", &token).await;
        expected.push_str(&token);
    }
    cluster.network().set_reply_loss(0);

    assert_eq!(clerk.get("k").await, Some(expected));
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leaderless_group_rejects_requests() {
    let cluster = cluster();
    cluster.add_group(1, 1).unwrap();
    let num = cluster.join(&[1]).unwrap();
    assert!(cluster.wait_for_config(num, SETTLE).await);

    cluster.set_leader(1, None).unwrap();
    let replica = cluster.server(1, 0).unwrap();
    let reply = replica.get(get_args("a", 3, 1)).await;
    assert_eq!(reply.status, Status::WrongLeader);

    replica.kill();
    let reply = replica.get(get_args("a", 3, 2)).await;
    assert_eq!(reply.status, Status::WrongLeader);
}

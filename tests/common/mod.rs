//! Shared helpers for the cluster tests
#![allow(dead_code)]

use shardkv::common::{ClientConfig, ServerConfig, N_SHARDS};
use shardkv::server::{GetArgs, RequestId};
use shardkv::Cluster;
use std::future::Future;
use std::time::{Duration, Instant};

pub const SETTLE: Duration = Duration::from_secs(10);

pub fn fast_server_config() -> ServerConfig {
    ServerConfig {
        poll_interval_ms: 20,
        migration_interval_ms: 10,
        pull_backoff_ms: 5,
        pull_backoff_max_ms: 50,
        ..Default::default()
    }
}

pub fn fast_client_config() -> ClientConfig {
    ClientConfig {
        get_backoff_ms: 20,
        put_append_backoff_ms: 20,
    }
}

pub fn cluster() -> Cluster {
    Cluster::new(fast_server_config(), fast_client_config())
}

/// A one-letter key that hashes to `shard`
pub fn key_in_shard(shard: usize) -> String {
    assert!(shard < N_SHARDS);
    (b'a'..=b'z')
        .find(|b| *b as usize % N_SHARDS == shard)
        .map(|b| (b as char).to_string())
        .unwrap()
}

pub fn get_args(key: &str, client_id: u64, seq: u64) -> GetArgs {
    GetArgs {
        key: key.to_string(),
        request: RequestId { client_id, seq },
    }
}

/// Poll `check` until it holds or `timeout` expires.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

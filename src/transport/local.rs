//! In-process network
//!
//! Routes calls directly to registered [`ShardKv`] replicas. Servers can be
//! made unreachable, and replies can be dropped at random after the request
//! has been executed, to exercise retry and duplicate handling.

use super::Transport;
use crate::common::{Error, Result};
use crate::server::{
    GetArgs, GetReply, PullShardArgs, PullShardReply, PutAppendArgs, PutAppendReply, ShardKv,
};
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Default)]
pub struct LocalNetwork {
    servers: RwLock<HashMap<String, Arc<ShardKv>>>,
    unreachable: RwLock<HashSet<String>>,
    /// Percentage of replies lost after execution
    reply_loss: AtomicU32,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, name: impl Into<String>, server: Arc<ShardKv>) {
        self.servers.write().unwrap().insert(name.into(), server);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ShardKv>> {
        self.servers.write().unwrap().remove(name)
    }

    pub fn set_reachable(&self, name: &str, reachable: bool) {
        let mut unreachable = self.unreachable.write().unwrap();
        if reachable {
            unreachable.remove(name);
        } else {
            unreachable.insert(name.to_string());
        }
    }

    /// Lose `percent` of replies (0 disables).
    pub fn set_reply_loss(&self, percent: u32) {
        self.reply_loss.store(percent.min(100), Ordering::Relaxed);
    }

    fn lookup(&self, name: &str) -> Result<Arc<ShardKv>> {
        if self.unreachable.read().unwrap().contains(name) {
            return Err(Error::ConnectionFailed(name.to_string()));
        }
        self.servers
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownServer(name.to_string()))
    }

    fn deliver<T>(&self, name: &str, reply: T) -> Result<T> {
        let loss = self.reply_loss.load(Ordering::Relaxed);
        if loss > 0 && rand::thread_rng().gen_range(0..100) < loss {
            tracing::trace!(server = name, "reply dropped");
            return Err(Error::ConnectionFailed(format!("{}: reply lost", name)));
        }
        Ok(reply)
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn get(&self, server: &str, args: GetArgs) -> Result<GetReply> {
        let kv = self.lookup(server)?;
        let reply = kv.get(args).await;
        self.deliver(server, reply)
    }

    async fn put_append(&self, server: &str, args: PutAppendArgs) -> Result<PutAppendReply> {
        let kv = self.lookup(server)?;
        let reply = kv.put_append(args).await;
        self.deliver(server, reply)
    }

    async fn pull_shard(&self, server: &str, args: PullShardArgs) -> Result<PullShardReply> {
        let kv = self.lookup(server)?;
        if kv.is_killed() {
            return Err(Error::ConnectionFailed(server.to_string()));
        }
        let reply = kv.pull_shard(args);
        self.deliver(server, reply)
    }
}

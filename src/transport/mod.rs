//! Server-to-server and client-to-server messaging
//!
//! Servers are addressed by name, as they appear in a configuration's group
//! list. A transport error means the request may or may not have reached
//! the server; callers treat it like a lost reply and retry.

pub mod local;

use crate::common::Result;
use crate::server::{
    GetArgs, GetReply, PullShardArgs, PullShardReply, PutAppendArgs, PutAppendReply,
};
use async_trait::async_trait;

pub use local::LocalNetwork;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn get(&self, server: &str, args: GetArgs) -> Result<GetReply>;

    async fn put_append(&self, server: &str, args: PutAppendArgs) -> Result<PutAppendReply>;

    async fn pull_shard(&self, server: &str, args: PullShardArgs) -> Result<PullShardReply>;
}

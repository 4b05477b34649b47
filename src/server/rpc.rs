//! RPC arguments, replies and status codes

use super::store::Session;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type ClientId = u64;

/// Outcome of a client RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    NoKey,
    /// Shard not assigned to this group in its current configuration
    WrongGroup,
    /// Shard assigned here but its content has not been migrated in yet
    ShardNotReady,
    /// Already applied; the reply carries the recorded result
    RepeatedRequest,
    WrongLeader,
    /// Not applied within the request timeout; may still be applied later
    Timeout,
}

impl Status {
    /// The client should refresh its configuration and use a new sequence
    /// number before trying again.
    pub fn is_routing_error(&self) -> bool {
        matches!(self, Status::WrongGroup | Status::ShardNotReady)
    }

    /// The operation took effect (now or on an earlier attempt).
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Ok | Status::NoKey | Status::RepeatedRequest)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::NoKey => "no-key",
            Status::WrongGroup => "wrong-group",
            Status::ShardNotReady => "shard-not-ready",
            Status::RepeatedRequest => "repeated-request",
            Status::WrongLeader => "wrong-leader",
            Status::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Idempotency key of a client request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId {
    pub client_id: ClientId,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub request: RequestId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub status: Status,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PutAppendOp {
    Put,
    Append,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub op: PutAppendOp,
    pub request: RequestId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAppendReply {
    pub status: Status,
}

/// Ask a former owner for a shard's content as of configuration `version`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullShardArgs {
    pub shard: usize,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullStatus {
    Ok,
    VersionNotAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullShardReply {
    pub status: PullStatus,
    pub data: BTreeMap<String, String>,
    pub sessions: BTreeMap<ClientId, Session>,
}

impl PullShardReply {
    pub fn unavailable() -> Self {
        Self {
            status: PullStatus::VersionNotAvailable,
            data: BTreeMap::new(),
            sessions: BTreeMap::new(),
        }
    }
}

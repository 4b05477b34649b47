use super::rpc::{ClientId, RequestId};
use super::store::Session;
use crate::common::Result;
use crate::shardctrler::Configuration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Commands that flow through the replicated log.
///
/// Each variant carries everything a replica needs to apply it without
/// further I/O, so every replica reaches the same state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Get {
        request: RequestId,
        key: String,
    },
    Put {
        request: RequestId,
        key: String,
        value: String,
    },
    Append {
        request: RequestId,
        key: String,
        value: String,
    },
    /// Adopt the next configuration
    ConfigAdvance(Configuration),
    /// Absorb a migrated shard
    InstallShard(ShardTransfer),
}

/// Shard content pulled from its previous owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTransfer {
    pub shard: usize,
    /// Configuration number at which the shard becomes servable here
    pub version: u64,
    pub data: BTreeMap<String, String>,
    pub sessions: BTreeMap<ClientId, Session>,
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Idempotency key and target key, for client operations
    pub fn client_op(&self) -> Option<(RequestId, &str)> {
        match self {
            Command::Get { request, key }
            | Command::Put { request, key, .. }
            | Command::Append { request, key, .. } => Some((*request, key.as_str())),
            Command::ConfigAdvance(_) | Command::InstallShard(_) => None,
        }
    }
}

//! Per-shard key/value storage and the client session (idempotency) table
//!
//! Both are plain data owned by the state machine. `BTreeMap` keeps their
//! serialized form identical on every replica that applied the same log.

use super::rpc::{ClientId, RequestId, Status};
use crate::shardctrler::Gid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One shard's content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Configuration number as of which this group is certified to hold the
    /// content
    pub version: u64,
    pub data: BTreeMap<String, String>,
}

impl Shard {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            data: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }

    pub fn put(&mut self, key: String, value: String) {
        self.data.insert(key, value);
    }

    /// Append to the current value; a missing key behaves like Put.
    pub fn append(&mut self, key: String, value: &str) {
        self.data.entry(key).or_default().push_str(value);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Group that last held a shard's content, and the configuration it held
/// it at. Survives configurations in which no group owns the shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub gid: Gid,
    pub num: u64,
    pub servers: Vec<String>,
}

/// Last request applied for a client, with its recorded result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub seq: u64,
    /// `Ok` or `NoKey`
    pub status: Status,
    /// Value returned by a Get; `None` for writes
    pub value: Option<String>,
}

/// Client id → last applied request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTable {
    sessions: BTreeMap<ClientId, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded session if `request` has already been applied
    pub fn duplicate(&self, request: &RequestId) -> Option<&Session> {
        self.sessions
            .get(&request.client_id)
            .filter(|s| s.seq >= request.seq)
    }

    pub fn record(&mut self, client_id: ClientId, session: Session) {
        self.sessions.insert(client_id, session);
    }

    /// Fold in sessions migrated from another group, keeping the higher
    /// sequence number per client.
    pub fn merge(&mut self, incoming: &BTreeMap<ClientId, Session>) {
        for (client_id, session) in incoming {
            match self.sessions.get(client_id) {
                Some(existing) if existing.seq >= session.seq => {}
                _ => {
                    self.sessions.insert(*client_id, session.clone());
                }
            }
        }
    }

    pub fn get(&self, client_id: ClientId) -> Option<&Session> {
        self.sessions.get(&client_id)
    }

    pub fn entries(&self) -> &BTreeMap<ClientId, Session> {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(seq: u64) -> Session {
        Session {
            seq,
            status: Status::Ok,
            value: None,
        }
    }

    #[test]
    fn test_shard_put_append() {
        let mut shard = Shard::new(1);
        shard.append("k".into(), "x");
        assert_eq!(shard.get("k").map(String::as_str), Some("x"));
        shard.append("k".into(), "y");
        assert_eq!(shard.get("k").map(String::as_str), Some("xy"));
        shard.put("k".into(), "z".into());
        assert_eq!(shard.get("k").map(String::as_str), Some("z"));
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut table = SessionTable::new();
        table.record(1, session(5));

        assert!(table.duplicate(&RequestId { client_id: 1, seq: 5 }).is_some());
        assert!(table.duplicate(&RequestId { client_id: 1, seq: 4 }).is_some());
        assert!(table.duplicate(&RequestId { client_id: 1, seq: 6 }).is_none());
        assert!(table.duplicate(&RequestId { client_id: 2, seq: 1 }).is_none());
    }

    #[test]
    fn test_merge_keeps_max_seq() {
        let mut table = SessionTable::new();
        table.record(1, session(5));
        table.record(2, session(1));

        let mut incoming = BTreeMap::new();
        incoming.insert(1, session(3));
        incoming.insert(2, session(8));
        incoming.insert(3, session(2));
        table.merge(&incoming);

        assert_eq!(table.get(1).map(|s| s.seq), Some(5));
        assert_eq!(table.get(2).map(|s| s.seq), Some(8));
        assert_eq!(table.get(3).map(|s| s.seq), Some(2));
        assert_eq!(table.len(), 3);
    }
}

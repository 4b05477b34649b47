//! In-process replicated log
//!
//! A single ordered log shared by every replica of a group. Proposals from
//! the designated leader are committed immediately and pushed to every
//! attached replica's commit stream. Replicas can be detached (crash or
//! partition) and re-attached later; a replica that fell behind a compacted
//! prefix is caught up with the latest snapshot first, like a follower
//! receiving InstallSnapshot.

use super::{ApplyMsg, Consensus, Proposal};
use crate::common::{Error, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

struct Peer {
    tx: Option<mpsc::UnboundedSender<ApplyMsg>>,
    /// Next index to deliver
    next: u64,
    /// Snapshot this replica would find on disk after a restart
    persisted: Option<(u64, Vec<u8>)>,
}

struct GroupLog {
    term: u64,
    leader: Option<usize>,
    /// Highest index covered by `base_snapshot`
    base_index: u64,
    base_snapshot: Vec<u8>,
    /// `entries[i]` sits at index `base_index + 1 + i`
    entries: Vec<Vec<u8>>,
    peers: Vec<Peer>,
}

impl GroupLog {
    fn last_index(&self) -> u64 {
        self.base_index + self.entries.len() as u64
    }

    fn catch_up(&mut self, me: usize) {
        let last = self.last_index();
        while self.peers[me].tx.is_some() && self.peers[me].next <= last {
            let next = self.peers[me].next;
            let msg = if next <= self.base_index {
                ApplyMsg::Snapshot {
                    index: self.base_index,
                    data: self.base_snapshot.clone(),
                }
            } else {
                ApplyMsg::Command {
                    index: next,
                    data: self.entries[(next - self.base_index - 1) as usize].clone(),
                }
            };
            let index = msg.index();
            let is_snapshot = matches!(msg, ApplyMsg::Snapshot { .. });
            let peer = &mut self.peers[me];
            let delivered = peer.tx.as_ref().map(|tx| tx.send(msg).is_ok()).unwrap_or(false);
            if !delivered {
                peer.tx = None;
                break;
            }
            if is_snapshot {
                peer.persisted = Some((index, self.base_snapshot.clone()));
            }
            peer.next = index + 1;
        }
    }
}

/// The shared log of one replica group
pub struct MemoryGroup {
    inner: Mutex<GroupLog>,
}

impl MemoryGroup {
    /// Create a log for `replicas` replicas; replica 0 starts as leader.
    pub fn new(replicas: usize) -> Arc<Self> {
        let peers = (0..replicas)
            .map(|_| Peer {
                tx: None,
                next: 1,
                persisted: None,
            })
            .collect();
        Arc::new(Self {
            inner: Mutex::new(GroupLog {
                term: 1,
                leader: Some(0),
                base_index: 0,
                base_snapshot: Vec::new(),
                entries: Vec::new(),
                peers,
            }),
        })
    }

    /// Consensus handle for replica `me`
    pub fn replica(self: &Arc<Self>, me: usize) -> MemoryRaft {
        MemoryRaft {
            group: Arc::clone(self),
            me,
        }
    }

    /// Connect replica `me` and return its commit stream. Delivery resumes
    /// after the replica's persisted snapshot, if any.
    pub fn attach(&self, me: usize) -> mpsc::UnboundedReceiver<ApplyMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut log = self.inner.lock().unwrap();
        let peer = &mut log.peers[me];
        peer.next = peer.persisted.as_ref().map(|(index, _)| index + 1).unwrap_or(1);
        peer.tx = Some(tx);
        log.catch_up(me);
        rx
    }

    /// Disconnect replica `me`; it stops receiving entries and cannot propose.
    pub fn detach(&self, me: usize) {
        self.inner.lock().unwrap().peers[me].tx = None;
    }

    /// Move leadership (or remove the leader with `None`); starts a new term.
    pub fn set_leader(&self, leader: Option<usize>) {
        let mut log = self.inner.lock().unwrap();
        log.term += 1;
        log.leader = leader;
        tracing::debug!(term = log.term, ?leader, "leadership changed");
    }

    pub fn leader(&self) -> Option<usize> {
        self.inner.lock().unwrap().leader
    }

    /// Snapshot replica `me` would restart from
    pub fn persisted_snapshot(&self, me: usize) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().peers[me]
            .persisted
            .as_ref()
            .map(|(_, data)| data.clone())
    }

    pub fn last_index(&self) -> u64 {
        self.inner.lock().unwrap().last_index()
    }

    /// First index still held as an individual entry
    pub fn first_index(&self) -> u64 {
        self.inner.lock().unwrap().base_index + 1
    }

    fn start(&self, me: usize, command: Vec<u8>) -> Result<Proposal> {
        let mut log = self.inner.lock().unwrap();
        if log.leader != Some(me) {
            return Err(Error::NotLeader);
        }
        if log.peers[me].tx.is_none() {
            return Err(Error::Detached(me));
        }
        log.entries.push(command);
        let index = log.last_index();
        for peer in 0..log.peers.len() {
            log.catch_up(peer);
        }
        Ok(Proposal {
            index,
            term: log.term,
        })
    }

    fn is_leader(&self, me: usize) -> bool {
        let log = self.inner.lock().unwrap();
        log.leader == Some(me) && log.peers[me].tx.is_some()
    }

    /// Bytes of entries past replica `me`'s own persisted snapshot
    pub fn log_size(&self, me: usize) -> usize {
        let log = self.inner.lock().unwrap();
        let covered = log.peers[me]
            .persisted
            .as_ref()
            .map(|(index, _)| *index)
            .unwrap_or(0)
            .max(log.base_index);
        log.entries
            .iter()
            .skip((covered - log.base_index) as usize)
            .map(|e| e.len())
            .sum()
    }

    fn snapshot(&self, me: usize, index: u64, snapshot: Vec<u8>) {
        let mut log = self.inner.lock().unwrap();
        if index > log.last_index() {
            tracing::warn!(replica = me, index, "snapshot beyond end of log ignored");
            return;
        }
        log.peers[me].persisted = Some((index, snapshot.clone()));
        if index > log.base_index {
            let drop = (index - log.base_index) as usize;
            log.entries.drain(..drop);
            log.base_index = index;
            log.base_snapshot = snapshot;
            tracing::debug!(replica = me, index, "log compacted");
        }
    }
}

/// Replica-side consensus handle backed by a [`MemoryGroup`]
pub struct MemoryRaft {
    group: Arc<MemoryGroup>,
    me: usize,
}

impl Consensus for MemoryRaft {
    fn start(&self, command: Vec<u8>) -> Result<Proposal> {
        self.group.start(self.me, command)
    }

    fn is_leader(&self) -> bool {
        self.group.is_leader(self.me)
    }

    fn log_size(&self) -> usize {
        self.group.log_size(self.me)
    }

    fn snapshot(&self, index: u64, snapshot: Vec<u8>) {
        self.group.snapshot(self.me, index, snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ApplyMsg>) -> Vec<ApplyMsg> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_only_leader_can_propose() {
        let group = MemoryGroup::new(3);
        let _rx0 = group.attach(0);
        let _rx1 = group.attach(1);

        assert!(group.replica(0).is_leader());
        assert!(matches!(group.replica(1).start(b"x".to_vec()), Err(Error::NotLeader)));

        let proposal = group.replica(0).start(b"x".to_vec()).unwrap();
        assert_eq!(proposal.index, 1);

        group.set_leader(Some(1));
        assert!(!group.replica(0).is_leader());
        let proposal = group.replica(1).start(b"y".to_vec()).unwrap();
        assert_eq!(proposal.index, 2);
        assert_eq!(proposal.term, 2);
    }

    #[test]
    fn test_entries_delivered_in_order_to_all() {
        let group = MemoryGroup::new(2);
        let mut rx0 = group.attach(0);
        let mut rx1 = group.attach(1);
        let raft = group.replica(0);
        raft.start(b"a".to_vec()).unwrap();
        raft.start(b"b".to_vec()).unwrap();

        let expected = vec![
            ApplyMsg::Command { index: 1, data: b"a".to_vec() },
            ApplyMsg::Command { index: 2, data: b"b".to_vec() },
        ];
        assert_eq!(drain(&mut rx0), expected);
        assert_eq!(drain(&mut rx1), expected);
    }

    #[test]
    fn test_detached_replica_catches_up() {
        let group = MemoryGroup::new(2);
        let _rx0 = group.attach(0);
        let mut rx1 = group.attach(1);
        let raft = group.replica(0);
        raft.start(b"a".to_vec()).unwrap();
        group.detach(1);
        raft.start(b"b".to_vec()).unwrap();
        drain(&mut rx1);

        let mut rx1 = group.attach(1);
        let msgs = drain(&mut rx1);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1], ApplyMsg::Command { index: 2, data: b"b".to_vec() });
    }

    #[test]
    fn test_lagging_replica_receives_snapshot() {
        let group = MemoryGroup::new(2);
        let _rx0 = group.attach(0);
        let raft = group.replica(0);
        for cmd in [b"a", b"b", b"c"] {
            raft.start(cmd.to_vec()).unwrap();
        }
        assert_eq!(group.log_size(0), 3);
        raft.snapshot(2, b"state@2".to_vec());
        assert_eq!(group.first_index(), 3);
        assert_eq!(group.log_size(0), 1);
        assert_eq!(group.log_size(1), 1);
        assert_eq!(group.persisted_snapshot(0), Some(b"state@2".to_vec()));

        let mut rx1 = group.attach(1);
        let msgs = drain(&mut rx1);
        assert_eq!(
            msgs,
            vec![
                ApplyMsg::Snapshot { index: 2, data: b"state@2".to_vec() },
                ApplyMsg::Command { index: 3, data: b"c".to_vec() },
            ]
        );
        assert_eq!(group.persisted_snapshot(1), Some(b"state@2".to_vec()));
    }

    #[test]
    fn test_restart_resumes_after_persisted_snapshot() {
        let group = MemoryGroup::new(1);
        let _rx = group.attach(0);
        let raft = group.replica(0);
        raft.start(b"a".to_vec()).unwrap();
        raft.start(b"b".to_vec()).unwrap();
        raft.snapshot(1, b"state@1".to_vec());
        group.detach(0);

        let mut rx = group.attach(0);
        assert_eq!(
            drain(&mut rx),
            vec![ApplyMsg::Command { index: 2, data: b"b".to_vec() }]
        );
    }
}

//! Interface to the replicated log
//!
//! Leader election, log replication and persistence live outside this crate.
//! A replica only needs to:
//! - propose an encoded command and learn the index it was placed at,
//! - consume committed entries (and installed snapshots) in log order,
//! - hand over a snapshot so the log prefix it covers can be discarded.

pub mod memory;

use crate::common::Result;

pub use memory::{MemoryGroup, MemoryRaft};

/// Delivered on the commit stream, strictly in index order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A committed command
    Command { index: u64, data: Vec<u8> },
    /// Replace local state with this snapshot, which covers every entry up
    /// to and including `index`
    Snapshot { index: u64, data: Vec<u8> },
}

impl ApplyMsg {
    pub fn index(&self) -> u64 {
        match self {
            ApplyMsg::Command { index, .. } | ApplyMsg::Snapshot { index, .. } => *index,
        }
    }
}

/// Where a proposed command was placed in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
}

/// One replica's handle on the replicated log
pub trait Consensus: Send + Sync + 'static {
    /// Propose a command. Must not block; fails with `Error::NotLeader`
    /// when this replica cannot accept proposals.
    fn start(&self, command: Vec<u8>) -> Result<Proposal>;

    fn is_leader(&self) -> bool;

    /// Bytes of log retained since the last snapshot
    fn log_size(&self) -> usize;

    /// State covering every entry up to `index` has been captured in
    /// `snapshot`; the log may drop that prefix.
    fn snapshot(&self, index: u64, snapshot: Vec<u8>);
}

//! Replica server of a shard-owning group
//!
//! Each `ShardKv` is one replica of one group. Replicas of a group share a
//! replicated log; every client operation, configuration change and shard
//! installation goes through that log, so all replicas apply them in the
//! same order.
//!
//! Tasks per replica:
//! - one per inbound RPC ([`ShardKv::get`], [`ShardKv::put_append`],
//!   [`ShardKv::pull_shard`])
//! - the applier, sole writer of the state machine
//! - the configuration poller
//! - the migration driver, plus one pull task per shard in migration
//!
//! All of them share a single lock around the state machine and the waiter
//! registry. The lock is never held across an await.

mod applier;
pub mod command;
mod migration;
mod poller;
pub mod rpc;
mod service;
pub mod snapshot;
pub mod state;
pub mod store;

use crate::common::{Error, Result, ServerConfig, N_SHARDS};
use crate::consensus::{ApplyMsg, Consensus};
use crate::shardctrler::{ConfigAuthority, Gid};
use crate::transport::Transport;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};

pub use command::{Command, ShardTransfer};
pub use rpc::{
    ClientId, GetArgs, GetReply, PullShardArgs, PullShardReply, PullStatus, PutAppendArgs,
    PutAppendOp, PutAppendReply, RequestId, Status,
};
pub use state::{Applied, ShardState, StateMachine};

/// Collaborators and identity of a replica
pub struct ReplicaSetup {
    pub gid: Gid,
    /// Index of this replica within its group
    pub me: usize,
    pub config: ServerConfig,
    pub consensus: Arc<dyn Consensus>,
    pub authority: Arc<dyn ConfigAuthority>,
    pub transport: Arc<dyn Transport>,
}

/// One-shot completion signal for a submitted command
struct Waiter {
    id: u64,
    tx: oneshot::Sender<Applied>,
}

/// State guarded by the replica lock
struct Replica {
    sm: StateMachine,
    /// Log index → handler waiting for that index to be applied
    waiters: HashMap<u64, Waiter>,
    next_waiter_id: u64,
}

pub struct ShardKv {
    gid: Gid,
    me: usize,
    config: ServerConfig,
    consensus: Arc<dyn Consensus>,
    authority: Arc<dyn ConfigAuthority>,
    transport: Arc<dyn Transport>,
    inner: Mutex<Replica>,
    /// Shards with a pull task running
    migrations: Mutex<HashSet<usize>>,
    dead: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Point-in-time view of a replica, for operators and tests
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaStatus {
    pub gid: Gid,
    pub me: usize,
    pub is_leader: bool,
    pub config_num: u64,
    pub last_applied: u64,
    pub sessions: usize,
    pub shards: Vec<ShardStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStatus {
    pub shard: usize,
    pub state: ShardState,
    pub version: u64,
    pub keys: usize,
}

impl ShardKv {
    /// Start a replica and its background tasks.
    ///
    /// `snapshot` is the state persisted by a previous incarnation, if any.
    /// A snapshot that fails to decode aborts startup rather than serving
    /// from partial state. Must be called within a tokio runtime.
    pub fn start(
        setup: ReplicaSetup,
        apply_rx: mpsc::UnboundedReceiver<ApplyMsg>,
        snapshot: Option<&[u8]>,
    ) -> Result<Arc<Self>> {
        setup.config.validate()?;
        let retention = setup.config.outbound_retention;
        let sm = match snapshot {
            Some(bytes) if !bytes.is_empty() => {
                let sm = StateMachine::restore(setup.gid, retention, bytes)?;
                tracing::info!(
                    gid = setup.gid,
                    replica = setup.me,
                    num = sm.current().num,
                    last_applied = sm.last_applied(),
                    "restored from snapshot"
                );
                sm
            }
            _ => StateMachine::new(setup.gid, retention),
        };

        let (shutdown, _) = watch::channel(false);
        let kv = Arc::new(Self {
            gid: setup.gid,
            me: setup.me,
            config: setup.config,
            consensus: setup.consensus,
            authority: setup.authority,
            transport: setup.transport,
            inner: Mutex::new(Replica {
                sm,
                waiters: HashMap::new(),
                next_waiter_id: 0,
            }),
            migrations: Mutex::new(HashSet::new()),
            dead: AtomicBool::new(false),
            shutdown,
        });

        tokio::spawn(applier::run(Arc::clone(&kv), apply_rx, kv.shutdown.subscribe()));
        tokio::spawn(poller::run(Arc::clone(&kv), kv.shutdown.subscribe()));
        tokio::spawn(migration::run(Arc::clone(&kv), kv.shutdown.subscribe()));

        tracing::info!(gid = kv.gid, replica = kv.me, "replica started");
        Ok(kv)
    }

    /// Stop background tasks. In-flight RPCs finish with a transient error.
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        tracing::info!(gid = self.gid, replica = self.me, "replica stopped");
    }

    pub fn is_killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn me(&self) -> usize {
        self.me
    }

    pub fn status(&self) -> ReplicaStatus {
        let replica = self.lock();
        let sm = &replica.sm;
        ReplicaStatus {
            gid: self.gid,
            me: self.me,
            is_leader: self.consensus.is_leader(),
            config_num: sm.current().num,
            last_applied: sm.last_applied(),
            sessions: sm.sessions().len(),
            shards: (0..N_SHARDS)
                .map(|shard| ShardStatus {
                    shard,
                    state: sm.shard_state(shard),
                    version: sm.shard(shard).version,
                    keys: sm.shard(shard).len(),
                })
                .collect(),
        }
    }

    /// Run `f` against the applied state.
    pub fn read<T>(&self, f: impl FnOnce(&StateMachine) -> T) -> T {
        f(&self.lock().sm)
    }

    fn lock(&self) -> MutexGuard<'_, Replica> {
        self.inner.lock().unwrap()
    }

    /// Submit a command nobody waits on (configuration changes, installs).
    fn propose(&self, command: &Command) -> Result<u64> {
        if self.is_killed() {
            return Err(Error::Shutdown);
        }
        let data = command.encode()?;
        Ok(self.consensus.start(data)?.index)
    }
}

//! Replicated state machine
//!
//! `StateMachine` is the state every replica of a group derives from the
//! committed log: the shard store, the session table and the
//! current/previous configuration pair. It is mutated only through
//! [`StateMachine::apply`] and [`StateMachine::install_snapshot`], both
//! driven by the applier in log order; everything else reads it.
//!
//! Shard lifecycle for this group:
//! - `Ready`: assigned here, version == current configuration number
//! - `PendingInbound`: assigned here, content still to be pulled from the
//!   previous owner
//! - `PendingOutbound`: moved away, content retained for the new owner to pull
//! - `NotOwned`: nothing held

use super::command::{Command, ShardTransfer};
use super::rpc::{PullShardArgs, PullShardReply, PullStatus, RequestId, Status};
use super::snapshot::{self, SnapshotImage};
use super::store::{Holder, Session, SessionTable, Shard};
use crate::common::{shard_for_key, Result, N_SHARDS};
use crate::shardctrler::{Configuration, Gid};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShardState {
    Ready,
    PendingInbound,
    PendingOutbound,
    NotOwned,
}

/// Result of applying one command, handed to the waiting RPC handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Request that was applied at this index, for client operations
    pub request: Option<RequestId>,
    pub status: Status,
    pub value: Option<String>,
}

impl Applied {
    fn internal(status: Status) -> Self {
        Self {
            request: None,
            status,
            value: None,
        }
    }
}

/// A shard this group must pull before serving it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPull {
    pub shard: usize,
    /// Configuration number to ask the previous owner for
    pub from_version: u64,
    /// Configuration number the shard becomes ready at
    pub to_version: u64,
    pub source: Gid,
    pub servers: Vec<String>,
}

enum ClientAction<'a> {
    Get,
    Put(&'a str),
    Append(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    gid: Gid,
    outbound_retention: Option<u64>,
    sessions: SessionTable,
    shards: Vec<Shard>,
    /// Last group to hold each shard as of the previous configuration
    holders: Vec<Option<Holder>>,
    current: Configuration,
    previous: Configuration,
    last_applied: u64,
}

impl StateMachine {
    pub fn new(gid: Gid, outbound_retention: Option<u64>) -> Self {
        Self {
            gid,
            outbound_retention,
            sessions: SessionTable::new(),
            shards: vec![Shard::default(); N_SHARDS],
            holders: vec![None; N_SHARDS],
            current: Configuration::default(),
            previous: Configuration::default(),
            last_applied: 0,
        }
    }

    /// Rebuild from a persisted snapshot; fails on corruption.
    pub fn restore(gid: Gid, outbound_retention: Option<u64>, bytes: &[u8]) -> Result<Self> {
        let mut sm = Self::new(gid, outbound_retention);
        sm.load_image(snapshot::decode(bytes)?);
        Ok(sm)
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn current(&self) -> &Configuration {
        &self.current
    }

    pub fn previous(&self) -> &Configuration {
        &self.previous
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn shard(&self, shard: usize) -> &Shard {
        &self.shards[shard]
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn shard_state(&self, shard: usize) -> ShardState {
        let stored = &self.shards[shard];
        if self.current.owns(self.gid, shard) {
            if stored.version == self.current.num {
                ShardState::Ready
            } else {
                ShardState::PendingInbound
            }
        } else if stored.version != 0 {
            ShardState::PendingOutbound
        } else {
            ShardState::NotOwned
        }
    }

    /// `Ok` if a key in `shard` may be served, otherwise the routing error
    pub fn serving_status(&self, shard: usize) -> Status {
        match self.shard_state(shard) {
            ShardState::Ready => Status::Ok,
            ShardState::PendingInbound => Status::ShardNotReady,
            ShardState::PendingOutbound | ShardState::NotOwned => Status::WrongGroup,
        }
    }

    pub fn duplicate(&self, request: &RequestId) -> Option<&Session> {
        self.sessions.duplicate(request)
    }

    /// True when every shard assigned here in the current configuration
    /// has been migrated in, so the next configuration may be adopted.
    pub fn migrations_settled(&self) -> bool {
        (0..N_SHARDS).all(|s| self.shard_state(s) != ShardState::PendingInbound)
    }

    pub fn pending_pulls(&self) -> Vec<PendingPull> {
        (0..N_SHARDS)
            .filter(|s| self.shard_state(*s) == ShardState::PendingInbound)
            .filter_map(|shard| {
                let holder = self.holders[shard].as_ref()?;
                Some(PendingPull {
                    shard,
                    from_version: holder.num,
                    to_version: self.current.num,
                    source: holder.gid,
                    servers: holder.servers.clone(),
                })
            })
            .collect()
    }

    /// Serve a migration pull from applied state.
    ///
    /// Content for `version` is only handed out once this replica has moved
    /// past that configuration, so it can no longer change.
    pub fn pull_shard(&self, args: &PullShardArgs) -> PullShardReply {
        if args.shard >= N_SHARDS || args.version == 0 {
            return PullShardReply::unavailable();
        }
        let stored = &self.shards[args.shard];
        if self.current.num <= args.version || stored.version != args.version {
            return PullShardReply::unavailable();
        }
        PullShardReply {
            status: PullStatus::Ok,
            data: stored.data.clone(),
            sessions: self.sessions.entries().clone(),
        }
    }

    /// Apply the command committed at `index`. Returns `None` for an index
    /// this state already covers.
    pub fn apply(&mut self, index: u64, command: &Command) -> Option<Applied> {
        if index <= self.last_applied {
            return None;
        }
        self.last_applied = index;

        let applied = match command {
            Command::Get { request, key } => self.apply_client(*request, key, ClientAction::Get),
            Command::Put { request, key, value } => {
                self.apply_client(*request, key, ClientAction::Put(value))
            }
            Command::Append { request, key, value } => {
                self.apply_client(*request, key, ClientAction::Append(value))
            }
            Command::ConfigAdvance(config) => self.apply_config(config),
            Command::InstallShard(transfer) => self.apply_install(transfer),
        };
        Some(applied)
    }

    fn apply_client(&mut self, request: RequestId, key: &str, action: ClientAction<'_>) -> Applied {
        if let Some(session) = self.sessions.duplicate(&request) {
            return Applied {
                request: Some(request),
                status: Status::RepeatedRequest,
                value: session.value.clone(),
            };
        }

        // Ownership may have changed since the request was submitted.
        let shard = shard_for_key(key);
        let status = self.serving_status(shard);
        if status != Status::Ok {
            return Applied {
                request: Some(request),
                status,
                value: None,
            };
        }

        let stored = &mut self.shards[shard];
        let (status, value) = match action {
            ClientAction::Get => match stored.get(key) {
                Some(v) => (Status::Ok, Some(v.clone())),
                None => (Status::NoKey, None),
            },
            ClientAction::Put(value) => {
                stored.put(key.to_string(), value.to_string());
                (Status::Ok, None)
            }
            ClientAction::Append(value) => {
                stored.append(key.to_string(), value);
                (Status::Ok, None)
            }
        };
        self.sessions.record(
            request.client_id,
            Session {
                seq: request.seq,
                status,
                value: value.clone(),
            },
        );
        Applied {
            request: Some(request),
            status,
            value,
        }
    }

    fn apply_config(&mut self, next: &Configuration) -> Applied {
        if next.num != self.current.num + 1 {
            tracing::debug!(
                gid = self.gid,
                current = self.current.num,
                proposed = next.num,
                "ignoring out-of-order configuration"
            );
            return Applied::internal(Status::Ok);
        }

        for shard in 0..N_SHARDS {
            // A shard nobody owns in the current configuration keeps the
            // holder it had before.
            let holder = match self.current.owner(shard) {
                0 => self.holders[shard].take(),
                gid => Some(Holder {
                    gid,
                    num: self.current.num,
                    servers: self.current.servers(gid).map(|s| s.to_vec()).unwrap_or_default(),
                }),
            };

            if next.owns(self.gid, shard) {
                let stored = &mut self.shards[shard];
                match &holder {
                    None => *stored = Shard::new(next.num),
                    Some(h) if h.gid == self.gid => {
                        if stored.version == h.num {
                            stored.version = next.num;
                        } else if h.num < self.current.num {
                            tracing::warn!(
                                gid = self.gid,
                                shard,
                                held = h.num,
                                "retained content was discarded, shard restarts empty"
                            );
                            *stored = Shard::new(next.num);
                        }
                    }
                    // Pulled from the holder.
                    Some(_) => {}
                }
            }
            self.holders[shard] = holder;
        }

        self.previous = std::mem::replace(&mut self.current, next.clone());

        if let Some(window) = self.outbound_retention {
            for shard in 0..N_SHARDS {
                let stored = &self.shards[shard];
                if !self.current.owns(self.gid, shard)
                    && stored.version != 0
                    && stored.version + window < self.current.num
                {
                    tracing::debug!(gid = self.gid, shard, version = stored.version, "discarding outbound shard");
                    self.shards[shard] = Shard::default();
                }
            }
        }

        tracing::info!(
            gid = self.gid,
            num = self.current.num,
            pending = self.pending_pulls().len(),
            "adopted configuration"
        );
        Applied::internal(Status::Ok)
    }

    fn apply_install(&mut self, transfer: &ShardTransfer) -> Applied {
        let shard = transfer.shard;
        if shard >= N_SHARDS
            || transfer.version != self.current.num
            || !self.current.owns(self.gid, shard)
            || self.shards[shard].version >= transfer.version
        {
            tracing::debug!(gid = self.gid, shard, version = transfer.version, "ignoring stale shard install");
            return Applied::internal(Status::Ok);
        }

        self.shards[shard] = Shard {
            version: transfer.version,
            data: transfer.data.clone(),
        };
        self.sessions.merge(&transfer.sessions);
        tracing::info!(
            gid = self.gid,
            shard,
            version = transfer.version,
            keys = transfer.data.len(),
            "installed shard"
        );
        Applied::internal(Status::Ok)
    }

    pub fn image(&self) -> SnapshotImage {
        SnapshotImage {
            last_applied: self.last_applied,
            current: self.current.clone(),
            previous: self.previous.clone(),
            shards: self.shards.clone(),
            holders: self.holders.clone(),
            sessions: self.sessions.clone(),
        }
    }

    pub fn snapshot(&self) -> Result<Vec<u8>> {
        snapshot::encode(&self.image())
    }

    /// Replace all state with a snapshot covering `index`. Returns false and
    /// leaves state untouched when the snapshot is not newer.
    pub fn install_snapshot(&mut self, index: u64, bytes: &[u8]) -> Result<bool> {
        if index <= self.last_applied {
            return Ok(false);
        }
        let mut image = snapshot::decode(bytes)?;
        image.last_applied = index;
        self.load_image(image);
        Ok(true)
    }

    fn load_image(&mut self, image: SnapshotImage) {
        self.last_applied = image.last_applied;
        self.current = image.current;
        self.previous = image.previous;
        self.shards = image.shards;
        self.holders = image.holders;
        self.sessions = image.sessions;
    }
}

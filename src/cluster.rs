//! In-process deployment
//!
//! Wires replica groups, their shared logs, the configuration authority and
//! the local network together in one process. Used by the simulator binary
//! and the integration tests to drive reconfigurations, leader changes,
//! crashes and restarts.

use crate::client::Clerk;
use crate::common::{ClientConfig, Config, Error, Result, ServerConfig};
use crate::consensus::MemoryGroup;
use crate::server::{ReplicaSetup, ReplicaStatus, ShardKv};
use crate::shardctrler::{Gid, MemoryAuthority};
use crate::transport::LocalNetwork;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Group {
    log: Arc<MemoryGroup>,
    replicas: Vec<Option<Arc<ShardKv>>>,
}

pub struct Cluster {
    authority: Arc<MemoryAuthority>,
    network: Arc<LocalNetwork>,
    groups: Mutex<BTreeMap<Gid, Group>>,
    server_config: ServerConfig,
    client_config: ClientConfig,
}

pub fn server_name(gid: Gid, me: usize) -> String {
    format!("server-{}-{}", gid, me)
}

impl Cluster {
    pub fn new(server_config: ServerConfig, client_config: ClientConfig) -> Self {
        Self {
            authority: Arc::new(MemoryAuthority::new()),
            network: LocalNetwork::new(),
            groups: Mutex::new(BTreeMap::new()),
            server_config,
            client_config,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.server.clone(), config.client.clone())
    }

    pub fn authority(&self) -> &Arc<MemoryAuthority> {
        &self.authority
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Start a group of `replicas` replicas. It serves nothing until it is
    /// joined into a configuration.
    pub fn add_group(&self, gid: Gid, replicas: usize) -> Result<()> {
        if gid == 0 || replicas == 0 {
            return Err(Error::InvalidConfig(format!(
                "group {} with {} replicas",
                gid, replicas
            )));
        }
        let mut groups = self.groups.lock().unwrap();
        if groups.contains_key(&gid) {
            return Err(Error::InvalidConfig(format!("group {} already exists", gid)));
        }
        let log = MemoryGroup::new(replicas);
        let mut started = Vec::with_capacity(replicas);
        for me in 0..replicas {
            started.push(Some(self.start_replica(gid, me, &log, None)?));
        }
        groups.insert(
            gid,
            Group {
                log,
                replicas: started,
            },
        );
        tracing::info!(gid, replicas, "group started");
        Ok(())
    }

    fn start_replica(
        &self,
        gid: Gid,
        me: usize,
        log: &Arc<MemoryGroup>,
        snapshot: Option<&[u8]>,
    ) -> Result<Arc<ShardKv>> {
        let setup = ReplicaSetup {
            gid,
            me,
            config: self.server_config.clone(),
            consensus: Arc::new(log.replica(me)),
            authority: self.authority.clone(),
            transport: self.network.clone(),
        };
        let apply_rx = log.attach(me);
        let kv = match ShardKv::start(setup, apply_rx, snapshot) {
            Ok(kv) => kv,
            Err(e) => {
                log.detach(me);
                return Err(e);
            }
        };
        self.network.register(server_name(gid, me), Arc::clone(&kv));
        Ok(kv)
    }

    fn group_servers(&self, gid: Gid) -> Result<Vec<String>> {
        let groups = self.groups.lock().unwrap();
        let group = groups
            .get(&gid)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown group {}", gid)))?;
        Ok((0..group.replicas.len()).map(|me| server_name(gid, me)).collect())
    }

    /// Publish a configuration that includes `gids`.
    pub fn join(&self, gids: &[Gid]) -> Result<u64> {
        let mut joining = BTreeMap::new();
        for gid in gids {
            joining.insert(*gid, self.group_servers(*gid)?);
        }
        self.authority.join(joining)
    }

    pub fn leave(&self, gids: &[Gid]) -> Result<u64> {
        self.authority.leave(gids)
    }

    pub fn move_shard(&self, shard: usize, gid: Gid) -> Result<u64> {
        self.authority.move_shard(shard, gid)
    }

    pub async fn clerk(&self) -> Result<Clerk> {
        Clerk::new(
            self.authority.clone(),
            self.network.clone(),
            self.client_config.clone(),
        )
        .await
    }

    pub fn server(&self, gid: Gid, me: usize) -> Option<Arc<ShardKv>> {
        let groups = self.groups.lock().unwrap();
        groups.get(&gid)?.replicas.get(me)?.clone()
    }

    /// Running replicas of a group
    pub fn servers(&self, gid: Gid) -> Vec<Arc<ShardKv>> {
        let groups = self.groups.lock().unwrap();
        groups
            .get(&gid)
            .map(|g| g.replicas.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn log(&self, gid: Gid) -> Option<Arc<MemoryGroup>> {
        self.groups.lock().unwrap().get(&gid).map(|g| g.log.clone())
    }

    /// Move leadership within a group; `None` leaves it leaderless.
    pub fn set_leader(&self, gid: Gid, leader: Option<usize>) -> Result<()> {
        let log = self
            .log(gid)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown group {}", gid)))?;
        log.set_leader(leader);
        Ok(())
    }

    /// Stop a replica as if its process died. Its persisted snapshot
    /// survives for [`Cluster::restart`].
    pub fn crash(&self, gid: Gid, me: usize) {
        let mut groups = self.groups.lock().unwrap();
        let Some(group) = groups.get_mut(&gid) else {
            return;
        };
        if let Some(kv) = group.replicas.get_mut(me).and_then(Option::take) {
            kv.kill();
            group.log.detach(me);
            self.network.remove(&server_name(gid, me));
            tracing::info!(gid, replica = me, "replica crashed");
        }
    }

    /// Start a crashed replica again from its persisted snapshot.
    pub fn restart(&self, gid: Gid, me: usize) -> Result<()> {
        let mut groups = self.groups.lock().unwrap();
        let group = groups
            .get_mut(&gid)
            .ok_or_else(|| Error::InvalidConfig(format!("unknown group {}", gid)))?;
        if me >= group.replicas.len() {
            return Err(Error::InvalidConfig(format!("group {} has no replica {}", gid, me)));
        }
        if group.replicas[me].is_some() {
            return Ok(());
        }
        let log = Arc::clone(&group.log);
        let snapshot = log.persisted_snapshot(me);
        let kv = self.start_replica(gid, me, &log, snapshot.as_deref())?;
        group.replicas[me] = Some(kv);
        tracing::info!(gid, replica = me, "replica restarted");
        Ok(())
    }

    /// Wait until every running replica has adopted configuration `num` (or
    /// later) and finished all migrations it requires.
    pub async fn wait_for_config(&self, num: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.all_replicas().iter().all(|kv| {
                kv.read(|sm| sm.current().num >= num && sm.migrations_settled())
            }) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn all_replicas(&self) -> Vec<Arc<ShardKv>> {
        let groups = self.groups.lock().unwrap();
        groups
            .values()
            .flat_map(|g| g.replicas.iter().flatten().cloned())
            .collect()
    }

    pub fn status(&self) -> Vec<ReplicaStatus> {
        self.all_replicas().iter().map(|kv| kv.status()).collect()
    }

    pub fn shutdown(&self) {
        for kv in self.all_replicas() {
            kv.kill();
        }
    }
}

//! In-process configuration authority
//!
//! Keeps the full configuration history in memory. Every membership change
//! produces a new configuration whose shards are spread evenly over the
//! groups while moving as few shards as possible.

use super::{ConfigAuthority, Configuration, Gid};
use crate::common::{Error, Result, N_SHARDS};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

pub struct MemoryAuthority {
    configs: Mutex<Vec<Configuration>>,
}

impl Default for MemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self {
            configs: Mutex::new(vec![Configuration::default()]),
        }
    }

    /// Newest configuration
    pub fn latest(&self) -> Configuration {
        let configs = self.configs.lock().unwrap();
        configs[configs.len() - 1].clone()
    }

    /// Add groups and rebalance. Returns the new configuration number.
    pub fn join(&self, groups: BTreeMap<Gid, Vec<String>>) -> Result<u64> {
        if groups.contains_key(&0) {
            return Err(Error::InvalidConfig("group id 0 is reserved".into()));
        }
        self.next_config(|config| {
            config.groups.extend(groups);
            rebalance(&mut config.shards, &config.groups);
        })
    }

    /// Remove groups and hand their shards to the remaining ones.
    pub fn leave(&self, gids: &[Gid]) -> Result<u64> {
        self.next_config(|config| {
            for gid in gids {
                config.groups.remove(gid);
            }
            rebalance(&mut config.shards, &config.groups);
        })
    }

    /// Pin a single shard to a group without rebalancing.
    pub fn move_shard(&self, shard: usize, gid: Gid) -> Result<u64> {
        if shard >= N_SHARDS {
            return Err(Error::InvalidConfig(format!("shard {} out of range", shard)));
        }
        if !self.latest().groups.contains_key(&gid) {
            return Err(Error::InvalidConfig(format!("unknown group {}", gid)));
        }
        self.next_config(|config| config.shards[shard] = gid)
    }

    fn next_config(&self, change: impl FnOnce(&mut Configuration)) -> Result<u64> {
        let mut configs = self.configs.lock().unwrap();
        let mut next = configs[configs.len() - 1].clone();
        next.num += 1;
        change(&mut next);
        let num = next.num;
        tracing::info!(num, shards = ?next.shards, "published configuration");
        configs.push(next);
        Ok(num)
    }
}

#[async_trait]
impl ConfigAuthority for MemoryAuthority {
    async fn query(&self, num: Option<u64>) -> Result<Configuration> {
        let configs = self.configs.lock().unwrap();
        let latest = configs.len() - 1;
        let idx = match num {
            Some(n) if (n as usize) < latest => n as usize,
            _ => latest,
        };
        Ok(configs[idx].clone())
    }
}

/// Spread shards evenly over `groups`, keeping existing placements where
/// possible. Deterministic for a given input.
fn rebalance(shards: &mut [Gid; N_SHARDS], groups: &BTreeMap<Gid, Vec<String>>) {
    if groups.is_empty() {
        *shards = [0; N_SHARDS];
        return;
    }

    let mut owned: BTreeMap<Gid, Vec<usize>> = groups.keys().map(|g| (*g, Vec::new())).collect();
    let mut free = Vec::new();
    for (shard, gid) in shards.iter().enumerate() {
        match owned.get_mut(gid) {
            Some(list) => list.push(shard),
            None => free.push(shard),
        }
    }

    // Heaviest groups keep the extra shards so fewer shards move.
    let mut order: Vec<Gid> = owned.keys().copied().collect();
    order.sort_by(|a, b| owned[b].len().cmp(&owned[a].len()).then(a.cmp(b)));
    let base = N_SHARDS / order.len();
    let extra = N_SHARDS % order.len();
    let target = |rank: usize| base + usize::from(rank < extra);

    for (rank, gid) in order.iter().enumerate() {
        if let Some(list) = owned.get_mut(gid) {
            while list.len() > target(rank) {
                if let Some(shard) = list.pop() {
                    free.push(shard);
                }
            }
        }
    }

    free.sort_unstable();
    free.reverse();
    for (rank, gid) in order.iter().enumerate() {
        if let Some(list) = owned.get_mut(gid) {
            while list.len() < target(rank) {
                match free.pop() {
                    Some(shard) => list.push(shard),
                    None => break,
                }
            }
        }
    }

    for (gid, list) in owned {
        for shard in list {
            shards[shard] = gid;
        }
    }
}

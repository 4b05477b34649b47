//! Shard configurations and the authority that publishes them
//!
//! A [`Configuration`] says which replica group owns each shard and which
//! servers make up each group. Configurations are numbered; number 0 is the
//! initial one in which no group owns anything.

pub mod memory;

use crate::common::{Result, N_SHARDS};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use memory::MemoryAuthority;

/// Replica group identifier; 0 means "unassigned"
pub type Gid = u64;

/// A numbered shard→group assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub num: u64,
    pub shards: [Gid; N_SHARDS],
    pub groups: BTreeMap<Gid, Vec<String>>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            num: 0,
            shards: [0; N_SHARDS],
            groups: BTreeMap::new(),
        }
    }
}

impl Configuration {
    /// Group that owns `shard` (0 if unassigned)
    pub fn owner(&self, shard: usize) -> Gid {
        self.shards[shard]
    }

    pub fn owns(&self, gid: Gid, shard: usize) -> bool {
        self.shards[shard] == gid
    }

    /// Server names of a group, if the group is part of this configuration
    pub fn servers(&self, gid: Gid) -> Option<&[String]> {
        self.groups.get(&gid).map(|v| v.as_slice())
    }

    /// Shards assigned to `gid`
    pub fn shards_of(&self, gid: Gid) -> Vec<usize> {
        (0..N_SHARDS).filter(|s| self.shards[*s] == gid).collect()
    }
}

/// The external configuration authority (shard controller)
#[async_trait]
pub trait ConfigAuthority: Send + Sync + 'static {
    /// Fetch configuration `num`; `None`, or a number beyond the newest,
    /// returns the newest configuration.
    async fn query(&self, num: Option<u64>) -> Result<Configuration>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_configuration() {
        let config = Configuration::default();
        assert_eq!(config.num, 0);
        assert!(config.shards.iter().all(|g| *g == 0));
        assert!(config.servers(1).is_none());
        assert_eq!(config.shards_of(0).len(), N_SHARDS);
    }

    #[test]
    fn test_ownership_helpers() {
        let mut config = Configuration {
            num: 3,
            ..Default::default()
        };
        config.shards[2] = 7;
        config.groups.insert(7, vec!["g7-0".into(), "g7-1".into()]);

        assert!(config.owns(7, 2));
        assert!(!config.owns(7, 3));
        assert_eq!(config.owner(2), 7);
        assert_eq!(config.shards_of(7), vec![2]);
        assert_eq!(config.servers(7).map(|s| s.len()), Some(2));
    }
}

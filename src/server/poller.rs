//! Configuration poller
//!
//! The leader asks the authority for the configuration after the current
//! one and proposes it, but only once every shard the current configuration
//! assigns here has arrived. Configurations are adopted one at a time.

use super::{Command, ShardKv};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

pub(super) async fn run(kv: Arc<ShardKv>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(kv.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => poll_config(&kv).await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn poll_config(kv: &ShardKv) {
    if kv.is_killed() || !kv.consensus.is_leader() {
        return;
    }
    let (num, settled) = kv.read(|sm| (sm.current().num, sm.migrations_settled()));
    if !settled {
        return;
    }

    let next = match kv.authority.query(Some(num + 1)).await {
        Ok(next) => next,
        Err(e) => {
            tracing::warn!(gid = kv.gid, error = %e, "configuration query failed");
            return;
        }
    };
    if next.num != num + 1 {
        return;
    }

    let proposed = next.num;
    match kv.propose(&Command::ConfigAdvance(next)) {
        Ok(index) => {
            tracing::debug!(gid = kv.gid, num = proposed, index, "proposed configuration")
        }
        Err(e) => tracing::debug!(gid = kv.gid, error = %e, "configuration proposal rejected"),
    }
}

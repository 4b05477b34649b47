//! Shard migration driver
//!
//! On the leader, one task per pending inbound shard pulls the content from
//! the previous owner and proposes an `InstallShard` through the log. The
//! install only takes effect if the configuration is still the one the pull
//! was made for, so a stale task is harmless.

use super::state::PendingPull;
use super::{Command, PullShardArgs, PullStatus, ShardKv, ShardTransfer};
use crate::common::{Backoff, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

pub(super) async fn run(kv: Arc<ShardKv>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(kv.config.migration_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => spawn_pulls(&kv, &shutdown),
            _ = shutdown.changed() => break,
        }
    }
}

fn spawn_pulls(kv: &Arc<ShardKv>, shutdown: &watch::Receiver<bool>) {
    if kv.is_killed() || !kv.consensus.is_leader() {
        return;
    }
    let pulls = kv.read(|sm| sm.pending_pulls());
    if pulls.is_empty() {
        return;
    }

    let mut running = kv.migrations.lock().unwrap();
    for pull in pulls {
        if !running.insert(pull.shard) {
            continue;
        }
        let kv = Arc::clone(kv);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let shard = pull.shard;
            if let Err(e) = pull_shard(&kv, pull, shutdown).await {
                tracing::debug!(gid = kv.gid, shard, error = %e, "shard pull abandoned");
            }
            kv.migrations.lock().unwrap().remove(&shard);
        });
    }
}

/// Still worth pulling: leader, alive, and the shard still pending for the
/// same configuration.
fn still_pending(kv: &ShardKv, pull: &PendingPull) -> bool {
    !kv.is_killed()
        && kv.consensus.is_leader()
        && kv.read(|sm| sm.pending_pulls().iter().any(|p| p == pull))
}

async fn pull_shard(
    kv: &ShardKv,
    pull: PendingPull,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut backoff = Backoff::new(
        Duration::from_millis(kv.config.pull_backoff_ms),
        Duration::from_millis(kv.config.pull_backoff_max_ms),
    );
    let args = PullShardArgs {
        shard: pull.shard,
        version: pull.from_version,
    };

    while still_pending(kv, &pull) {
        for server in &pull.servers {
            let reply = match kv.transport.pull_shard(server, args).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::trace!(gid = kv.gid, server = %server, error = %e, "pull failed");
                    continue;
                }
            };
            if reply.status != PullStatus::Ok {
                continue;
            }

            let transfer = ShardTransfer {
                shard: pull.shard,
                version: pull.to_version,
                data: reply.data,
                sessions: reply.sessions,
            };
            tracing::info!(
                gid = kv.gid,
                shard = pull.shard,
                from = pull.source,
                version = pull.to_version,
                keys = transfer.data.len(),
                "pulled shard"
            );
            match kv.propose(&Command::InstallShard(transfer)) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(gid = kv.gid, shard = pull.shard, error = %e, "install not proposed, retrying");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff.next_delay()) => {}
            _ = shutdown.changed() => break,
        }
    }
    Ok(())
}

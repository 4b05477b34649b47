//! Applier task: consumes the commit stream in order

use super::{Command, ShardKv};
use crate::consensus::ApplyMsg;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub(super) async fn run(
    kv: Arc<ShardKv>,
    mut rx: mpsc::UnboundedReceiver<ApplyMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => handle(&kv, msg),
                None => {
                    tracing::debug!(gid = kv.gid, replica = kv.me, "commit stream closed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

fn handle(kv: &ShardKv, msg: ApplyMsg) {
    match msg {
        ApplyMsg::Command { index, data } => apply_command(kv, index, &data),
        ApplyMsg::Snapshot { index, data } => install_snapshot(kv, index, &data),
    }
}

fn apply_command(kv: &ShardKv, index: u64, data: &[u8]) {
    let command = match Command::decode(data) {
        Ok(command) => command,
        Err(e) => {
            tracing::error!(gid = kv.gid, index, error = %e, "undecodable log entry, skipping");
            return;
        }
    };

    let mut replica = kv.lock();
    let Some(applied) = replica.sm.apply(index, &command) else {
        return;
    };
    if let Some(waiter) = replica.waiters.remove(&index) {
        // The handler may have timed out already.
        let _ = waiter.tx.send(applied);
    }

    let Some(max) = kv.config.max_raft_state else {
        return;
    };
    if kv.consensus.log_size() > max {
        match replica.sm.snapshot() {
            Ok(bytes) => {
                tracing::debug!(
                    gid = kv.gid,
                    replica = kv.me,
                    index,
                    bytes = bytes.len(),
                    "compacting log"
                );
                kv.consensus.snapshot(index, bytes);
            }
            Err(e) => tracing::warn!(gid = kv.gid, error = %e, "snapshot encode failed"),
        }
    }
}

fn install_snapshot(kv: &ShardKv, index: u64, data: &[u8]) {
    let mut replica = kv.lock();
    match replica.sm.install_snapshot(index, data) {
        Ok(true) => {
            // Commands up to `index` were applied elsewhere; nobody will
            // complete these waiters.
            replica.waiters.retain(|i, _| *i > index);
            tracing::info!(
                gid = kv.gid,
                replica = kv.me,
                index,
                num = replica.sm.current().num,
                "installed snapshot"
            );
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(gid = kv.gid, replica = kv.me, index, error = %e, "rejecting snapshot");
        }
    }
}

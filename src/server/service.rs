//! Client-facing RPC handlers (command submission path)

use super::rpc::{
    GetArgs, GetReply, PullShardArgs, PullShardReply, PutAppendArgs, PutAppendOp, PutAppendReply,
    RequestId, Status,
};
use super::{Command, ShardKv, Waiter};
use crate::common::shard_for_key;
use tokio::sync::oneshot;

/// Removes a waiter registration on every exit path. Only removes the entry
/// it created: the same index may have been re-registered by a later
/// submission after a leadership change.
struct WaiterGuard<'a> {
    kv: &'a ShardKv,
    index: u64,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut replica = self.kv.lock();
        if replica.waiters.get(&self.index).map(|w| w.id) == Some(self.id) {
            replica.waiters.remove(&self.index);
        }
    }
}

impl ShardKv {
    pub async fn get(&self, args: GetArgs) -> GetReply {
        let (status, value) = self
            .execute(Command::Get {
                request: args.request,
                key: args.key,
            })
            .await;
        GetReply { status, value }
    }

    pub async fn put_append(&self, args: PutAppendArgs) -> PutAppendReply {
        let command = match args.op {
            PutAppendOp::Put => Command::Put {
                request: args.request,
                key: args.key,
                value: args.value,
            },
            PutAppendOp::Append => Command::Append {
                request: args.request,
                key: args.key,
                value: args.value,
            },
        };
        let (status, _) = self.execute(command).await;
        PutAppendReply { status }
    }

    /// Hand a shard's content to the group that now owns it. Read-only and
    /// served by any replica from its applied state.
    pub fn pull_shard(&self, args: PullShardArgs) -> PullShardReply {
        let reply = self.read(|sm| sm.pull_shard(&args));
        tracing::debug!(
            gid = self.gid,
            replica = self.me,
            shard = args.shard,
            version = args.version,
            status = ?reply.status,
            "served shard pull"
        );
        reply
    }

    async fn execute(&self, command: Command) -> (Status, Option<String>) {
        if self.is_killed() {
            return (Status::WrongLeader, None);
        }
        let Some((request, key)) = command.client_op() else {
            return (Status::WrongLeader, None);
        };

        let (index, id, rx) = match self.submit(request, key, &command) {
            Ok(registered) => registered,
            Err(reply) => return reply,
        };
        let _guard = WaiterGuard {
            kv: self,
            index,
            id,
        };

        match tokio::time::timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(applied)) if applied.request == Some(request) => (applied.status, applied.value),
            Ok(Ok(applied)) => {
                tracing::debug!(
                    gid = self.gid,
                    index,
                    expected = ?request,
                    found = ?applied.request,
                    "different command committed at index"
                );
                (Status::WrongLeader, None)
            }
            // Waiter discarded by a snapshot install.
            Ok(Err(_)) => (Status::Timeout, None),
            Err(_) => (Status::Timeout, None),
        }
    }

    /// Validate and submit under the replica lock, registering the waiter
    /// before the applier can possibly reach the new index.
    #[allow(clippy::type_complexity)]
    fn submit(
        &self,
        request: RequestId,
        key: &str,
        command: &Command,
    ) -> Result<(u64, u64, oneshot::Receiver<super::Applied>), (Status, Option<String>)> {
        let mut replica = self.lock();

        if let Some(session) = replica.sm.duplicate(&request) {
            return Err((Status::RepeatedRequest, session.value.clone()));
        }
        let status = replica.sm.serving_status(shard_for_key(key));
        if status != Status::Ok {
            return Err((status, None));
        }

        let data = command.encode().map_err(|e| {
            tracing::warn!(error = %e, "failed to encode command");
            (Status::WrongLeader, None)
        })?;
        let proposal = self
            .consensus
            .start(data)
            .map_err(|_| (Status::WrongLeader, None))?;

        let id = replica.next_waiter_id;
        replica.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        replica.waiters.insert(proposal.index, Waiter { id, tx });
        tracing::trace!(gid = self.gid, index = proposal.index, ?request, "submitted");
        Ok((proposal.index, id, rx))
    }
}

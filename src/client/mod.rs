//! Client library
//!
//! A [`Clerk`] routes each operation to the group owning the key's shard,
//! tries that group's servers in turn, and refreshes its configuration when
//! told it has the wrong group. Operations retry until they succeed.
//!
//! Each operation carries `(client_id, seq)`. Retries of the same attempt
//! reuse the pair so a server that already applied it answers from its
//! session table. A routing rejection means the operation was not applied
//! by that server, so the next attempt takes a fresh sequence number, unless
//! an earlier try of the same number had an unknown outcome (lost reply or
//! timeout). That try may still land in the old owner's session table and
//! migrate with the shard, and only the old number will then match it.

use crate::common::{random_client_id, shard_for_key, ClientConfig, Result};
use crate::server::{ClientId, GetArgs, PutAppendArgs, PutAppendOp, RequestId, Status};
use crate::shardctrler::{ConfigAuthority, Configuration};
use crate::transport::Transport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct Clerk {
    authority: Arc<dyn ConfigAuthority>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    client_id: ClientId,
    seq: AtomicU64,
    shard_config: Mutex<Configuration>,
}

impl Clerk {
    /// Create a clerk and fetch the newest configuration.
    pub async fn new(
        authority: Arc<dyn ConfigAuthority>,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let shard_config = authority.query(None).await?;
        let client_id = random_client_id();
        tracing::debug!(client_id, num = shard_config.num, "clerk created");
        Ok(Self {
            authority,
            transport,
            config,
            client_id,
            seq: AtomicU64::new(0),
            shard_config: Mutex::new(shard_config),
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn next_request(&self) -> RequestId {
        RequestId {
            client_id: self.client_id,
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Request id for the next attempt after a routing rejection
    fn after_rejection(&self, request: RequestId, uncertain: bool) -> RequestId {
        if uncertain {
            request
        } else {
            self.next_request()
        }
    }

    /// Owning group's servers for `key` under the cached configuration
    fn servers_for(&self, key: &str) -> Vec<String> {
        let config = self.shard_config.lock().unwrap();
        let gid = config.owner(shard_for_key(key));
        config.servers(gid).map(|s| s.to_vec()).unwrap_or_default()
    }

    async fn refresh(&self, backoff: Duration) {
        tokio::time::sleep(backoff).await;
        match self.authority.query(None).await {
            Ok(latest) => {
                let mut config = self.shard_config.lock().unwrap();
                if latest.num > config.num {
                    tracing::debug!(client_id = self.client_id, num = latest.num, "configuration refreshed");
                    *config = latest;
                }
            }
            Err(e) => tracing::warn!(client_id = self.client_id, error = %e, "configuration query failed"),
        }
    }

    /// Current value of `key`, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> Option<String> {
        let backoff = Duration::from_millis(self.config.get_backoff_ms);
        let mut request = self.next_request();
        let mut uncertain = false;
        loop {
            for server in self.servers_for(key) {
                let args = GetArgs {
                    key: key.to_string(),
                    request,
                };
                let reply = match self.transport.get(&server, args).await {
                    Ok(reply) => reply,
                    Err(_) => {
                        uncertain = true;
                        continue;
                    }
                };
                match reply.status {
                    Status::Ok | Status::RepeatedRequest => return reply.value,
                    Status::NoKey => return None,
                    Status::Timeout => uncertain = true,
                    status if status.is_routing_error() => {
                        request = self.after_rejection(request, uncertain);
                        break;
                    }
                    _ => {}
                }
            }
            self.refresh(backoff).await;
        }
    }

    pub async fn put(&self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendOp::Put).await
    }

    pub async fn append(&self, key: &str, value: &str) {
        self.put_append(key, value, PutAppendOp::Append).await
    }

    pub async fn put_append(&self, key: &str, value: &str, op: PutAppendOp) {
        let backoff = Duration::from_millis(self.config.put_append_backoff_ms);
        let mut request = self.next_request();
        let mut uncertain = false;
        loop {
            for server in self.servers_for(key) {
                let args = PutAppendArgs {
                    key: key.to_string(),
                    value: value.to_string(),
                    op,
                    request,
                };
                let reply = match self.transport.put_append(&server, args).await {
                    Ok(reply) => reply,
                    Err(_) => {
                        uncertain = true;
                        continue;
                    }
                };
                match reply.status {
                    status if status.is_success() => return,
                    Status::Timeout => uncertain = true,
                    status if status.is_routing_error() => {
                        request = self.after_rejection(request, uncertain);
                        break;
                    }
                    _ => {}
                }
            }
            self.refresh(backoff).await;
        }
    }
}

use std::time::Duration;

use futures_util::future::{BoxFuture, join_all};
use redis::RedisResult;

use crate::cluster::{Access, ClusterManager};
use crate::error::{TrackerError, TrackerResult};
use crate::store::{KeyRead, KvStore, StoredValue};

/// `KvStore` over the cluster. Every key is routed to the node owning its slot.
#[derive(Clone)]
pub struct RedisClusterStore {
    manager: ClusterManager,
}

impl RedisClusterStore {
    pub fn new(manager: ClusterManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ClusterManager {
        &self.manager
    }
}

impl KvStore for RedisClusterStore {
    fn put_with_ttl(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, TrackerResult<()>> {
        let manager = self.manager.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        Box::pin(async move {
            let handle = manager.get_client().await?;
            handle
                .run(&key, Access::Write, |mut conn| {
                    let (key, value) = (key.clone(), value.clone());
                    async move {
                        let reply: RedisResult<()> = redis::cmd("SET")
                            .arg(&key)
                            .arg(&value)
                            .arg("PX")
                            .arg(ttl_ms)
                            .query_async(&mut conn)
                            .await;
                        reply
                    }
                })
                .await
        })
    }

    fn fetch_with_ttl(&self, keys: Vec<String>) -> BoxFuture<'static, TrackerResult<Vec<KeyRead>>> {
        let manager = self.manager.clone();
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let handle = manager.get_client().await?;
            let timeout = manager.command_timeout();
            // Keys hash to arbitrary slots, so each is read on its own node and
            // fails on its own; GET and PTTL share one round trip.
            let reads = keys.iter().map(|key| {
                let read = handle.run(key, Access::Read, |mut conn| {
                    let key = key.clone();
                    async move {
                        let reply: RedisResult<(Option<String>, i64)> = redis::pipe()
                            .cmd("GET")
                            .arg(&key)
                            .cmd("PTTL")
                            .arg(&key)
                            .query_async(&mut conn)
                            .await;
                        reply
                    }
                });
                async move {
                    match tokio::time::timeout(timeout, read).await {
                        Ok(Ok((Some(value), ttl_ms))) if ttl_ms != -2 => {
                            Ok(Some(StoredValue { value, ttl_ms }))
                        }
                        // PTTL -2: expired between the two reads.
                        Ok(Ok(_)) => Ok(None),
                        Ok(Err(err)) => Err(err),
                        Err(_) => Err(TrackerError::Timeout(timeout.as_millis() as u64)),
                    }
                }
            });
            Ok(join_all(reads).await)
        })
    }

    fn delete(&self, key: String) -> BoxFuture<'static, TrackerResult<bool>> {
        let manager = self.manager.clone();
        Box::pin(async move {
            let handle = manager.get_client().await?;
            let removed: i64 = handle
                .run(&key, Access::Write, |mut conn| {
                    let key = key.clone();
                    async move { redis::cmd("DEL").arg(&key).query_async(&mut conn).await }
                })
                .await?;
            Ok(removed > 0)
        })
    }

    fn set_add(&self, set: String, member: String) -> BoxFuture<'static, TrackerResult<bool>> {
        let manager = self.manager.clone();
        Box::pin(async move {
            let handle = manager.get_client().await?;
            let added: i64 = handle
                .run(&set, Access::Write, |mut conn| {
                    let (set, member) = (set.clone(), member.clone());
                    async move {
                        redis::cmd("SADD")
                            .arg(&set)
                            .arg(&member)
                            .query_async(&mut conn)
                            .await
                    }
                })
                .await?;
            Ok(added > 0)
        })
    }

    fn set_members(&self, set: String) -> BoxFuture<'static, TrackerResult<Vec<String>>> {
        let manager = self.manager.clone();
        Box::pin(async move {
            let handle = manager.get_client().await?;
            handle
                .run(&set, Access::Read, |mut conn| {
                    let set = set.clone();
                    async move { redis::cmd("SMEMBERS").arg(&set).query_async(&mut conn).await }
                })
                .await
        })
    }

    fn set_remove(
        &self,
        set: String,
        members: Vec<String>,
    ) -> BoxFuture<'static, TrackerResult<usize>> {
        let manager = self.manager.clone();
        Box::pin(async move {
            if members.is_empty() {
                return Ok(0);
            }
            let handle = manager.get_client().await?;
            let removed: i64 = handle
                .run(&set, Access::Write, |mut conn| {
                    let (set, members) = (set.clone(), members.clone());
                    async move {
                        redis::cmd("SREM")
                            .arg(&set)
                            .arg(&members)
                            .query_async(&mut conn)
                            .await
                    }
                })
                .await?;
            Ok(usize::try_from(removed).unwrap_or(0))
        })
    }
}

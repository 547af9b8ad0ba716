mod cluster_store;
mod memory;

pub use cluster_store::RedisClusterStore;
pub use memory::MemoryStore;

use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::error::TrackerResult;

/// A value read back together with its remaining time-to-live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: String,
    /// Remaining TTL in milliseconds, `PTTL` style: `-1` means no expiry.
    pub ttl_ms: i64,
}

/// Outcome of reading one key in a bulk fetch. A node that cannot be reached
/// fails only the keys it owns.
pub type KeyRead = TrackerResult<Option<StoredValue>>;

/// Storage operations the registry needs. Futures are `'static` so
/// implementations clone what they need out of `&self`.
pub trait KvStore: Send + Sync {
    /// Write `value` under `key`, expiring after `ttl`.
    fn put_with_ttl(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, TrackerResult<()>>;

    /// Read each key with its TTL, in input order. Missing keys come back as
    /// `Ok(None)`; a key whose node failed comes back as `Err`.
    fn fetch_with_ttl(&self, keys: Vec<String>) -> BoxFuture<'static, TrackerResult<Vec<KeyRead>>>;

    fn delete(&self, key: String) -> BoxFuture<'static, TrackerResult<bool>>;

    /// Add to a set; `true` if the member was new.
    fn set_add(&self, set: String, member: String) -> BoxFuture<'static, TrackerResult<bool>>;

    fn set_members(&self, set: String) -> BoxFuture<'static, TrackerResult<Vec<String>>>;

    /// Remove members from a set, returning how many were present.
    fn set_remove(
        &self,
        set: String,
        members: Vec<String>,
    ) -> BoxFuture<'static, TrackerResult<usize>>;
}

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{DecodeError, TrackerError, TrackerResult};
use crate::order_key::{OrderKey, escape};
use crate::store::{KeyRead, KvStore};
use crate::types::{Marketplace, OrderRecord};

pub const REGISTRY_PREFIX: &str = "bids";

/// Key of the registry set holding order keys for one task on one marketplace.
pub fn registry_key(task_id: &str, marketplace: Marketplace) -> String {
    format!("{REGISTRY_PREFIX}:{}:{marketplace}", escape(task_id))
}

/// Outcome of the record write + set add pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Indexed,
    /// The record was written but the registry set add failed. The record
    /// stays invisible to reconciliation and expires on its own.
    Unindexed,
}

/// Registry set membership, split into decodable keys and the rest.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub keys: Vec<OrderKey>,
    pub undecodable: Vec<DecodeError>,
}

/// Per-task, per-marketplace index of live order keys.
///
/// Membership is a hint only: a listed key may point at a record that has
/// already expired.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn KvStore>,
}

impl Registry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Write the record with `ttl`, then index its key. The two writes are not
    /// atomic; a failed index write is logged and reported, not rolled back.
    pub async fn register_order(
        &self,
        key: &OrderKey,
        record: &OrderRecord,
        ttl: Duration,
    ) -> TrackerResult<RegisterOutcome> {
        if ttl.is_zero() {
            return Err(TrackerError::Config("order ttl must be positive".into()));
        }
        let encoded = key.encode();
        let value = serde_json::to_string(record)?;
        self.store.put_with_ttl(encoded.clone(), value, ttl).await?;

        let set = registry_key(&key.task_id, key.marketplace);
        match self.store.set_add(set, encoded.clone()).await {
            Ok(_) => {
                debug!(
                    task_id = %key.task_id,
                    marketplace = %key.marketplace,
                    key = %encoded,
                    ttl_secs = ttl.as_secs(),
                    "order registered"
                );
                Ok(RegisterOutcome::Indexed)
            }
            Err(err) => {
                warn!(
                    task_id = %key.task_id,
                    marketplace = %key.marketplace,
                    key = %encoded,
                    error = %err,
                    "order record written but not indexed"
                );
                Ok(RegisterOutcome::Unindexed)
            }
        }
    }

    /// Current set membership, which may include orphaned keys.
    pub async fn list_candidate_keys(
        &self,
        task_id: &str,
        marketplace: Marketplace,
    ) -> TrackerResult<Candidates> {
        let members = self
            .store
            .set_members(registry_key(task_id, marketplace))
            .await?;
        let mut candidates = Candidates::default();
        for raw in members {
            match OrderKey::decode(&raw) {
                Ok(key) if key.task_id == task_id && key.marketplace == marketplace => {
                    candidates.keys.push(key)
                }
                Ok(key) => candidates.undecodable.push(DecodeError::new(
                    &raw,
                    format!(
                        "registered under {task_id}/{marketplace} but encodes {}/{}",
                        key.task_id, key.marketplace
                    ),
                )),
                Err(err) => candidates.undecodable.push(err),
            }
        }
        Ok(candidates)
    }

    /// Bulk read of the records behind `keys`, in order, with remaining TTL.
    /// A record on an unreachable node fails alone.
    pub async fn fetch_records(&self, keys: &[OrderKey]) -> TrackerResult<Vec<KeyRead>> {
        self.store
            .fetch_with_ttl(keys.iter().map(OrderKey::encode).collect())
            .await
    }

    /// Cancel path: drop the key from the registry set, then delete the record.
    /// Returns whether the key was registered.
    pub async fn remove_order(
        &self,
        task_id: &str,
        marketplace: Marketplace,
        key: &OrderKey,
    ) -> TrackerResult<bool> {
        if key.task_id != task_id || key.marketplace != marketplace {
            return Err(TrackerError::KeyMismatch {
                task_id: task_id.to_string(),
                marketplace,
            });
        }
        let encoded = key.encode();
        let removed = self
            .store
            .set_remove(registry_key(task_id, marketplace), vec![encoded.clone()])
            .await?;
        if let Err(err) = self.store.delete(encoded.clone()).await {
            warn!(%task_id, %marketplace, key = %encoded, error = %err, "order record delete failed");
        }
        debug!(%task_id, %marketplace, key = %encoded, removed, "order removed");
        Ok(removed > 0)
    }

    /// Remove members whose record is gone or undecodable. Members whose
    /// record could not be read are kept. Returns how many were removed.
    pub async fn prune_orphans(&self, task_id: &str, marketplace: Marketplace) -> TrackerResult<usize> {
        let candidates = self.list_candidate_keys(task_id, marketplace).await?;
        let records = self.fetch_records(&candidates.keys).await?;

        let mut orphans: Vec<String> = candidates
            .keys
            .iter()
            .zip(&records)
            .filter(|(_, record)| matches!(record, Ok(None)))
            .map(|(key, _)| key.encode())
            .collect();
        orphans.extend(candidates.undecodable.into_iter().map(|e| e.key));

        if orphans.is_empty() {
            return Ok(0);
        }
        let removed = self
            .store
            .set_remove(registry_key(task_id, marketplace), orphans)
            .await?;
        debug!(%task_id, %marketplace, removed, "pruned orphaned registry entries");
        Ok(removed)
    }
}

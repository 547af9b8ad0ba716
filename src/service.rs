use std::sync::Arc;

use tracing::info;

use crate::auth::Authorizer;
use crate::cluster::ClusterManager;
use crate::config::AppConfig;
use crate::error::TrackerResult;
use crate::order_key::OrderKey;
use crate::reconcile::ReconcileEngine;
use crate::registry::Registry;
use crate::store::RedisClusterStore;
use crate::tasks::{ConfiguredTaskSource, TaskSource};
use crate::types::{Marketplace, ProgressReport};

/// Dashboard entry points. Every call is authorized before anything is read.
#[derive(Clone)]
pub struct ProgressService {
    authorizer: Authorizer,
    tasks: Arc<dyn TaskSource>,
    engine: ReconcileEngine,
}

impl ProgressService {
    pub fn new(authorizer: Authorizer, tasks: Arc<dyn TaskSource>, engine: ReconcileEngine) -> Self {
        Self {
            authorizer,
            tasks,
            engine,
        }
    }

    /// Wire up the cluster-backed service. No connection is opened until the
    /// first call.
    pub fn from_config(config: &AppConfig, manager: ClusterManager) -> TrackerResult<Self> {
        config.validate()?;
        let registry = Registry::new(Arc::new(RedisClusterStore::new(manager)));
        Ok(Self::new(
            Authorizer::from_config(&config.auth),
            Arc::new(ConfiguredTaskSource::from_config(&config.tasks)?),
            ReconcileEngine::new(registry, config.progress.deadline()),
        ))
    }

    pub fn registry(&self) -> &Registry {
        self.engine.registry()
    }

    /// Live offers for `task_id`. Store trouble shows up as a partial report,
    /// never as an error.
    pub async fn get_progress(
        &self,
        credential: Option<&str>,
        task_id: &str,
    ) -> TrackerResult<ProgressReport> {
        self.authorizer.authorize(credential)?;
        let task = self.tasks.fetch_task(task_id).await?;
        Ok(self.engine.get_progress(&task).await)
    }

    /// Drop one order from the registry. Best-effort: the live marketplace
    /// order is not retracted. Returns whether the key was registered.
    pub async fn cancel(
        &self,
        credential: Option<&str>,
        task_id: &str,
        marketplace: Marketplace,
        order_key: &str,
    ) -> TrackerResult<bool> {
        self.authorizer.authorize(credential)?;
        let key = OrderKey::decode(order_key)?;
        let removed = self.registry().remove_order(task_id, marketplace, &key).await?;
        info!(%task_id, %marketplace, key = %key, removed, "cancel requested");
        Ok(removed)
    }

    /// Remove orphaned registry entries of `task_id` on every marketplace.
    pub async fn prune(&self, credential: Option<&str>, task_id: &str) -> TrackerResult<usize> {
        self.authorizer.authorize(credential)?;
        let mut total = 0;
        for marketplace in Marketplace::ALL {
            total += self.registry().prune_orphans(task_id, marketplace).await?;
        }
        info!(%task_id, removed = total, "registry pruned");
        Ok(total)
    }
}

//! Datasource instances keyed by uid.
//!
//! An instance lives until its settings change; a new `updated` timestamp
//! produces a fresh instance and the old one is disposed.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::datasource::Datasource;
use crate::error::BridgeError;
use crate::host::DataSourceInstanceSettings;

pub struct InstanceManager {
    module: Arc<str>,
    instances: DashMap<String, Arc<Datasource>>,
    /// Serializes instance creation per uid.
    creating: DashMap<String, Arc<Mutex<()>>>,
}

impl InstanceManager {
    /// Create a manager whose instances all host `module`.
    pub fn new(module: impl Into<Arc<str>>) -> Self {
        Self {
            module: module.into(),
            instances: DashMap::new(),
            creating: DashMap::new(),
        }
    }

    /// Instance for `settings`, created on first use or when the settings
    /// changed since the cached one was built.
    pub async fn get(
        &self,
        settings: &DataSourceInstanceSettings,
    ) -> Result<Arc<Datasource>, BridgeError> {
        if let Some(existing) = self.current(settings) {
            return Ok(existing);
        }

        let lock = self.creating.entry(settings.uid.clone()).or_default().clone();
        let _guard = lock.lock().await;
        // Another caller may have built it while we waited.
        if let Some(existing) = self.current(settings) {
            return Ok(existing);
        }
        if self.instances.contains_key(&settings.uid) {
            info!("Settings of datasource {} changed, replacing instance", settings.uid);
        }

        let fresh = Arc::new(Datasource::new(settings.clone(), self.module.clone()).await?);
        if let Some(old) = self.instances.insert(settings.uid.clone(), fresh.clone()) {
            if let Err(e) = old.dispose().await {
                error!("Failed to dispose replaced instance {}: {}", settings.uid, e);
            }
        }
        Ok(fresh)
    }

    /// Cached instance built from the same settings revision.
    fn current(&self, settings: &DataSourceInstanceSettings) -> Option<Arc<Datasource>> {
        self.instances
            .get(&settings.uid)
            .filter(|entry| entry.value().settings().updated == settings.updated)
            .map(|entry| entry.value().clone())
    }

    /// Drop and dispose the instance for `uid`, if any.
    pub async fn remove(&self, uid: &str) -> Result<(), BridgeError> {
        match self.instances.remove(uid) {
            Some((_, instance)) => instance.dispose().await,
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Dispose every instance. Failures are logged and the first is returned.
    pub async fn dispose_all(&self) -> Result<(), BridgeError> {
        let uids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        let instances: Vec<Arc<Datasource>> = uids
            .iter()
            .filter_map(|uid| self.instances.remove(uid).map(|(_, instance)| instance))
            .collect();

        let results = join_all(instances.iter().map(|instance| instance.dispose())).await;
        let mut first = None;
        for result in results {
            if let Err(e) = result {
                error!("Failed to dispose instance: {}", e);
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

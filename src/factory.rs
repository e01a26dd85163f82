//! Creates clients and pools, and keeps named pools for reuse

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, instrument, warn};

use crate::client::TorHttpClient;
use crate::config::{Config, ServiceConfig};
use crate::error::Result;
use crate::models::{HttpSettings, PoolSettings, ProcessInstanceConfig};
use crate::pool::TorPool;
use crate::service::{PortAllocator, ProcessExecutor, RandomPortAllocator, TokioProcessExecutor};

pub const DEFAULT_POOL: &str = "default";

pub struct TorPoolFactory {
    service: Arc<ServiceConfig>,
    executor: Arc<dyn ProcessExecutor>,
    allocator: Arc<dyn PortAllocator>,
    pool_defaults: PoolSettings,
    http_defaults: HttpSettings,
    pools: DashMap<String, Arc<TorPool>>,
}

impl TorPoolFactory {
    /// Factory running real Tor processes with random ports
    pub fn new(config: &Config) -> Self {
        Self::with_parts(
            Arc::new(config.service.clone()),
            Arc::new(TokioProcessExecutor::new(config.service.stop_grace())),
            Arc::new(RandomPortAllocator::new()),
            config.pool.clone(),
            config.http.clone(),
        )
    }

    pub fn with_parts(
        service: Arc<ServiceConfig>,
        executor: Arc<dyn ProcessExecutor>,
        allocator: Arc<dyn PortAllocator>,
        pool_defaults: PoolSettings,
        http_defaults: HttpSettings,
    ) -> Self {
        Self {
            service,
            executor,
            allocator,
            pool_defaults,
            http_defaults,
            pools: DashMap::new(),
        }
    }

    /// Uninitialized, unregistered pool
    pub fn create(&self) -> Arc<TorPool> {
        Arc::new(TorPool::new(
            self.service.clone(),
            self.executor.clone(),
            self.allocator.clone(),
        ))
    }

    /// Initialized, unregistered pool; check its status for readiness
    pub async fn create_and_initialize(
        &self,
        pool: PoolSettings,
        http: HttpSettings,
    ) -> Result<Arc<TorPool>> {
        let created = self.create();
        created.initialize(pool, http).await?;
        Ok(created)
    }

    /// Registered pool `name`, created and initialized on first use
    ///
    /// A pool whose members did not all come up is returned unregistered, so
    /// the next call for `name` starts over. The caller owns it and should
    /// disconnect it.
    #[instrument(skip(self, pool, http))]
    pub async fn create_and_initialize_or_get(
        &self,
        name: &str,
        pool: PoolSettings,
        http: HttpSettings,
    ) -> Result<Arc<TorPool>> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }

        let created = self.create();
        if !created.initialize(pool, http).await? {
            warn!("Pool {} failed to connect; not registering it", name);
            return Ok(created);
        }

        let registered = self
            .pools
            .entry(name.to_string())
            .or_insert_with(|| created.clone())
            .clone();

        if !Arc::ptr_eq(&registered, &created) {
            // Someone else registered the name while we were initializing.
            created.disconnect_all().await;
        } else {
            info!("Registered pool {} ({} clients)", name, registered.len());
        }
        Ok(registered)
    }

    /// The default pool, built from the configured defaults
    pub async fn get_or_default(&self) -> Result<Arc<TorPool>> {
        self.create_and_initialize_or_get(
            DEFAULT_POOL,
            self.pool_defaults.clone(),
            self.http_defaults.clone(),
        )
        .await
    }

    pub fn get(&self, name: &str) -> Option<Arc<TorPool>> {
        self.pools.get(name).map(|entry| entry.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Unregister `name` and disconnect its clients
    pub async fn remove(&self, name: &str) -> bool {
        match self.pools.remove(name) {
            Some((_, pool)) => {
                pool.disconnect_all().await;
                info!("Removed pool {}", name);
                true
            }
            None => false,
        }
    }

    /// Disconnect and unregister every pool
    pub async fn disconnect_all(&self) {
        for name in self.names() {
            self.remove(&name).await;
        }
    }

    /// Uninitialized standalone client
    pub fn create_client(&self) -> TorHttpClient {
        TorHttpClient::new(self.service.clone(), self.executor.clone())
    }

    /// Standalone client; without `process` it gets allocated ports and a generated data directory
    pub async fn create_and_initialize_client(
        &self,
        id: &str,
        http: HttpSettings,
        process: Option<ProcessInstanceConfig>,
    ) -> Result<TorHttpClient> {
        let (process, allocated) = match process {
            Some(process) => (process, None),
            None => {
                let ports = self.allocator.allocate()?;
                let process = ProcessInstanceConfig::new(ports.control, ports.socks)
                    .with_generated_data_directory(&self.service.data_root, &self.allocator.token());
                (process, Some(ports))
            }
        };

        let client = self.create_client();
        let ready = client.initialize(id, http, process).await;

        if let Some(ports) = allocated {
            if matches!(ready, Ok(true)) {
                client.release_ports_on_disconnect(self.allocator.clone(), ports);
            } else {
                self.allocator.release(ports);
            }
        }
        ready?;
        Ok(client)
    }
}

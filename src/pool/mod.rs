//! Pool of proxied clients behind one logical client
//!
//! Members are initialized concurrently and only exposed once every
//! initialization has finished. Each request goes to exactly one ready member
//! chosen by the balancing strategy; when the chosen member is not ready the
//! pool polls until one is, bounded by the configured wait timeout.

pub mod balancing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use reqwest::{Request, Response};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::client::TorHttpClient;
use crate::config::ServiceConfig;
use crate::error::{Result, TorPoolError};
use crate::models::{ClientStatus, HttpSettings, PoolSettings, ProcessInstanceConfig};
use crate::service::{PortAllocator, PortPair, ProcessExecutor};
use balancing::{create_selector, BalancingStrategy, ClientSelector};

pub use balancing::{RandomSelector, RoundRobinSelector};

pub struct TorPool {
    service: Arc<ServiceConfig>,
    executor: Arc<dyn ProcessExecutor>,
    allocator: Arc<dyn PortAllocator>,
    settings: RwLock<PoolSettings>,
    clients: RwLock<Vec<TorHttpClient>>,
    allocated: Mutex<Vec<PortPair>>,
    selector: RwLock<Arc<dyn ClientSelector>>,
    status: RwLock<ClientStatus>,
    initialized: AtomicBool,
}

impl TorPool {
    pub fn new(
        service: Arc<ServiceConfig>,
        executor: Arc<dyn ProcessExecutor>,
        allocator: Arc<dyn PortAllocator>,
    ) -> Self {
        Self {
            service,
            executor,
            allocator,
            settings: RwLock::new(PoolSettings::default()),
            clients: RwLock::new(Vec::new()),
            allocated: Mutex::new(Vec::new()),
            selector: RwLock::new(Arc::from(create_selector(BalancingStrategy::default()))),
            status: RwLock::new(ClientStatus::Uninitialized),
            initialized: AtomicBool::new(false),
        }
    }

    /// Start every member concurrently
    ///
    /// Ok(true) only when all members became ready.
    #[instrument(skip(self, settings, http), fields(size = settings.size, balancing = %settings.balancing))]
    pub async fn initialize(&self, settings: PoolSettings, http: HttpSettings) -> Result<bool> {
        if settings.size < 1 {
            return Err(TorPoolError::InvalidConfig(
                "pool size must be at least 1".into(),
            ));
        }
        if !settings.randomize_ports {
            check_sequential_ranges(&settings)?;
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(TorPoolError::AlreadyInitialized("pool".into()));
        }

        *self.status.write() = ClientStatus::ConnectingToProxy;
        let strategy = BalancingStrategy::from_str(&settings.balancing);
        *self.selector.write() = Arc::from(create_selector(strategy));

        let mut members = Vec::with_capacity(settings.size);
        for index in 0..settings.size {
            let process = match self.instance_config(&settings, index) {
                Ok(process) => process,
                Err(e) => {
                    self.release_ports();
                    *self.status.write() = ClientStatus::FailedToConnect;
                    return Err(e);
                }
            };

            let mut client_http = http.clone();
            if settings.randomize_ports && client_http.user_agent.is_none() {
                client_http.user_agent = settings.user_agents.choose(&mut rand::thread_rng()).cloned();
            }

            members.push((
                settings.client_id(index),
                TorHttpClient::new(self.service.clone(), self.executor.clone()),
                client_http,
                process,
            ));
        }

        let results = join_all(members.iter().map(|(id, client, http, process)| {
            client.initialize(id, http.clone(), process.clone())
        }))
        .await;

        let mut all_ready = true;
        for ((id, _, _, _), result) in members.iter().zip(results) {
            match result {
                Ok(true) => debug!("Pool member {} ready", id),
                Ok(false) => {
                    all_ready = false;
                    warn!("Pool member {} failed to connect", id);
                }
                Err(e) => {
                    all_ready = false;
                    error!("Pool member {} failed to initialize: {}", id, e);
                }
            }
        }

        *self.clients.write() = members.into_iter().map(|(_, client, _, _)| client).collect();
        *self.settings.write() = settings;
        *self.status.write() = if all_ready {
            ClientStatus::ConnectedToProxy
        } else {
            ClientStatus::FailedToConnect
        };

        info!(
            "Pool initialized with {} clients using {} balancing (all ready: {})",
            self.len(),
            strategy.as_str(),
            all_ready
        );
        Ok(all_ready)
    }

    fn instance_config(&self, settings: &PoolSettings, index: usize) -> Result<ProcessInstanceConfig> {
        let ports = if settings.randomize_ports {
            let ports = self.allocator.allocate()?;
            self.allocated.lock().push(ports);
            ports
        } else {
            sequential_ports(settings, index)?
        };

        Ok(ProcessInstanceConfig::new(ports.control, ports.socks)
            .with_generated_data_directory(&self.service.data_root, &self.allocator.token()))
    }

    fn release_ports(&self) {
        for ports in self.allocated.lock().drain(..) {
            self.allocator.release(ports);
        }
    }

    /// Pick a ready member, polling while none is chosen
    pub async fn select_ready(&self, cancel: Option<&CancellationToken>) -> Result<TorHttpClient> {
        let clients = self.clients.read().clone();
        if clients.is_empty() {
            return Err(TorPoolError::NotReady {
                status: self.status(),
            });
        }

        let selector = self.selector.read().clone();
        let (poll_delay, wait_timeout) = {
            let settings = self.settings.read();
            (settings.poll_delay(), settings.wait_timeout())
        };
        let started = Instant::now();
        let deadline = started + wait_timeout;

        loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(TorPoolError::Canceled);
            }

            let index = selector.select(clients.len());
            let client = &clients[index];
            if client.is_ready() {
                return Ok(client.clone());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("No ready client after {:?}", wait_timeout);
                return Err(TorPoolError::Timeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            let pause = poll_delay.min(deadline - now);
            match cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = sleep(pause) => {}
                        _ = cancel.cancelled() => return Err(TorPoolError::Canceled),
                    }
                }
                None => sleep(pause).await,
            }
        }
    }

    pub async fn send(&self, request: Request) -> Result<Response> {
        self.select_ready(None).await?.send(request).await
    }

    /// Like [`send`](Self::send), giving up with `Canceled` once `cancel` fires
    pub async fn send_with_cancel(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.select_ready(Some(cancel)).await?.send(request).await
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        self.select_ready(None).await?.get(url).await
    }

    /// Disconnect every member concurrently and give their ports back
    pub async fn disconnect_all(&self) {
        let clients = self.clients.read().clone();
        join_all(clients.iter().map(|client| client.disconnect())).await;
        self.release_ports();
        *self.status.write() = ClientStatus::Disconnected;
        info!("Pool disconnected ({} clients)", clients.len());
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.read()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clients(&self) -> Vec<TorHttpClient> {
        self.clients.read().clone()
    }

    pub fn client(&self, index: usize) -> Option<TorHttpClient> {
        self.clients.read().get(index).cloned()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.selector.read().strategy_name()
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings.read().clone()
    }
}

/// Ports of member `index` when ports are assigned sequentially
pub fn sequential_ports(settings: &PoolSettings, index: usize) -> Result<PortPair> {
    let offset = u16::try_from(index)
        .map_err(|_| TorPoolError::InvalidConfig(format!("pool index {} out of port range", index)))?;
    let control = settings.starting_control_port.checked_add(offset);
    let socks = settings.starting_socks_port.checked_add(offset);

    match (control, socks) {
        (Some(control), Some(socks)) => Ok(PortPair { control, socks }),
        _ => Err(TorPoolError::InvalidConfig(format!(
            "pool member {} runs past port 65535",
            index
        ))),
    }
}

/// Sequential control and SOCKS ranges must not share a port
fn check_sequential_ranges(settings: &PoolSettings) -> Result<()> {
    let size = settings.size as u64;
    let control = u64::from(settings.starting_control_port);
    let socks = u64::from(settings.starting_socks_port);

    if control < socks + size && socks < control + size {
        return Err(TorPoolError::InvalidConfig(format!(
            "control ports {}..{} overlap SOCKS ports {}..{}",
            control,
            control + size,
            socks,
            socks + size
        )));
    }
    Ok(())
}

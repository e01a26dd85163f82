//! HTTP client bound to one supervised Tor process

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use reqwest::{Method, Request, RequestBuilder, Response};
use tracing::{debug, info, instrument, warn};

use super::renewal::RenewalPolicy;
use super::transport::build_transport;
use crate::config::ServiceConfig;
use crate::error::{Result, TorPoolError};
use crate::models::{
    ClientStatus, HttpSettings, NetworkProbeResult, ProcessInstanceConfig, ProcessStatus,
};
use crate::service::{PortAllocator, PortPair, ProcessExecutor, ProcessSupervisor, StartOutcome};

/// Proxied HTTP client
///
/// Cloning shares the same process, transport and counters.
#[derive(Clone)]
pub struct TorHttpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: RwLock<String>,
    service: Arc<ServiceConfig>,
    supervisor: ProcessSupervisor,
    status: RwLock<ClientStatus>,
    last_error: RwLock<Option<String>>,
    last_probe: RwLock<Option<NetworkProbeResult>>,
    transport: RwLock<Option<reqwest::Client>>,
    policy: RwLock<RenewalPolicy>,
    request_count: AtomicU64,
    renewal_attempts: AtomicU64,
    last_renewal: Mutex<Instant>,
    initialized: AtomicBool,
    /// Ports handed back to their allocator on disconnect
    lease: Mutex<Option<(Arc<dyn PortAllocator>, PortPair)>>,
}

impl TorHttpClient {
    pub fn new(service: Arc<ServiceConfig>, executor: Arc<dyn ProcessExecutor>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                id: RwLock::new(String::new()),
                supervisor: ProcessSupervisor::new(service.clone(), executor),
                service,
                status: RwLock::new(ClientStatus::Uninitialized),
                last_error: RwLock::new(None),
                last_probe: RwLock::new(None),
                transport: RwLock::new(None),
                policy: RwLock::new(RenewalPolicy::default()),
                request_count: AtomicU64::new(0),
                renewal_attempts: AtomicU64::new(0),
                last_renewal: Mutex::new(Instant::now()),
                initialized: AtomicBool::new(false),
                lease: Mutex::new(None),
            }),
        }
    }

    /// Release `ports` back to `allocator` when this client disconnects
    pub fn release_ports_on_disconnect(&self, allocator: Arc<dyn PortAllocator>, ports: PortPair) {
        *self.inner.lease.lock() = Some((allocator, ports));
    }

    /// Start the Tor process, verify it routes through Tor and build the transport
    ///
    /// Ok(false) means the process failed to come up; see [`last_error`](Self::last_error).
    #[instrument(skip(self, id, http, process), fields(id = %id, socks_port = process.socks_port))]
    pub async fn initialize(
        &self,
        id: &str,
        http: HttpSettings,
        process: ProcessInstanceConfig,
    ) -> Result<bool> {
        // Settings problems surface before anything is spawned.
        let transport = build_transport(&http, &process)?;

        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Err(TorPoolError::AlreadyInitialized(self.id()));
        }
        *self.inner.id.write() = id.to_string();

        self.inner.set_status(ClientStatus::ConnectingToProxy);
        let supervisor = &self.inner.supervisor;

        if supervisor.start(process, None).await? == StartOutcome::FailedToStart {
            return Ok(self.fail_initialization().await);
        }

        if !supervisor
            .wait_for_startup(Some(self.inner.service.startup_timeout()))
            .await
        {
            if supervisor.status() == ProcessStatus::Starting {
                self.inner.record_error(format!(
                    "Tor did not finish bootstrapping within {:?}",
                    self.inner.service.startup_timeout()
                ));
            }
            return Ok(self.fail_initialization().await);
        }

        let probe = supervisor.get_network_status().await;
        *self.inner.last_probe.write() = Some(probe.clone());
        if !probe.success {
            self.inner.record_error(
                probe
                    .error
                    .unwrap_or_else(|| "network probe failed".to_string()),
            );
            return Ok(self.fail_initialization().await);
        }
        self.inner.set_status(ClientStatus::ConnectedToProxy);

        *self.inner.transport.write() = Some(transport);
        *self.inner.policy.write() = RenewalPolicy::from_settings(&http);
        *self.inner.last_renewal.lock() = Instant::now();
        self.inner.set_status(ClientStatus::ClientReady);

        info!("Client {} ready, exit address {:?}", id, probe.ip);
        Ok(true)
    }

    async fn fail_initialization(&self) -> bool {
        if let Some(error) = self.inner.supervisor.last_error() {
            if self.last_error().is_none() {
                *self.inner.last_error.write() = Some(error);
            }
        }
        self.inner.set_status(ClientStatus::FailedToConnect);
        self.inner.supervisor.dispose().await;
        warn!(
            "Client {} failed to connect: {}",
            self.id(),
            self.last_error().unwrap_or_default()
        );
        false
    }

    /// Start a request with this client's transport
    pub fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        Ok(self.ready_transport()?.request(method, url))
    }

    /// Send a request through Tor
    ///
    /// May trigger a background circuit renewal once the response (or error) is in.
    pub async fn send(&self, request: Request) -> Result<Response> {
        let transport = self.ready_transport()?;
        let count = self.inner.request_count.fetch_add(1, Ordering::SeqCst) + 1;

        debug!("Client {} sending {} {}", self.id(), request.method(), request.url());
        let result = transport.execute(request).await;

        self.inner.maybe_renew(count);
        Ok(result?)
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        let request = self.request(Method::GET, url)?.build()?;
        self.send(request).await
    }

    /// Stop the Tor process; safe to call more than once
    pub async fn disconnect(&self) {
        if self.status() == ClientStatus::Disconnected {
            return;
        }

        self.inner.supervisor.dispose().await;
        *self.inner.transport.write() = None;
        if let Some((allocator, ports)) = self.inner.lease.lock().take() {
            allocator.release(ports);
        }
        self.inner.set_status(ClientStatus::Disconnected);
        info!("Client {} disconnected", self.id());
    }

    /// Ask for a new identity now and re-probe the exit
    pub async fn request_clean_circuits(&self) -> Result<NetworkProbeResult> {
        let prior = {
            let mut status = self.inner.status.write();
            if !status.is_ready() {
                return Err(TorPoolError::NotReady { status: *status });
            }
            let prior = *status;
            *status = ClientStatus::RequestingCleanCircuits;
            prior
        };

        let probe = self.inner.renew_and_probe().await;

        {
            let mut status = self.inner.status.write();
            if *status == ClientStatus::RequestingCleanCircuits {
                *status = prior;
            }
        }

        Ok(probe)
    }

    pub fn id(&self) -> String {
        self.inner.id.read().clone()
    }

    pub fn status(&self) -> ClientStatus {
        *self.inner.status.read()
    }

    pub fn is_ready(&self) -> bool {
        self.status().is_ready()
    }

    pub fn process_status(&self) -> ProcessStatus {
        self.inner.supervisor.status()
    }

    pub fn process_config(&self) -> Option<ProcessInstanceConfig> {
        self.inner.supervisor.config()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }

    pub fn last_probe(&self) -> Option<NetworkProbeResult> {
        self.inner.last_probe.read().clone()
    }

    pub fn request_count(&self) -> u64 {
        self.inner.request_count.load(Ordering::SeqCst)
    }

    /// Renewals triggered by the automatic policy
    pub fn renewal_attempts(&self) -> u64 {
        self.inner.renewal_attempts.load(Ordering::SeqCst)
    }

    fn ready_transport(&self) -> Result<reqwest::Client> {
        let status = self.status();
        if !status.is_ready() {
            return Err(TorPoolError::NotReady { status });
        }
        self.inner
            .transport
            .read()
            .clone()
            .ok_or(TorPoolError::NotReady { status })
    }
}

impl std::fmt::Debug for TorHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorHttpClient")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

impl ClientInner {
    fn set_status(&self, status: ClientStatus) {
        let mut current = self.status.write();
        if *current != status {
            debug!("Client status: {} -> {}", *current, status);
            *current = status;
        }
    }

    fn record_error(&self, error: String) {
        *self.last_error.write() = Some(error);
    }

    fn maybe_renew(self: &Arc<Self>, request_count: u64) {
        let policy = *self.policy.read();
        if !policy.is_enabled() {
            return;
        }

        {
            let mut last = self.last_renewal.lock();
            if !policy.is_due(request_count, last.elapsed()) {
                return;
            }
            *last = Instant::now();
        }
        self.renewal_attempts.fetch_add(1, Ordering::SeqCst);

        let inner = self.clone();
        tokio::spawn(async move {
            let id = inner.id.read().clone();
            match inner.supervisor.request_clean_circuits().await {
                Ok(true) => info!("Client {} renewed circuits after {} requests", id, request_count),
                Ok(false) => warn!(
                    "Client {} circuit renewal rejected: {}",
                    id,
                    inner.supervisor.last_error().unwrap_or_default()
                ),
                Err(e) => warn!("Client {} circuit renewal skipped: {}", id, e),
            }
        });
    }

    async fn renew_and_probe(&self) -> NetworkProbeResult {
        let probe = match self.supervisor.request_clean_circuits().await {
            Ok(true) => self.supervisor.get_network_status().await,
            Ok(false) => NetworkProbeResult::failed(
                self.supervisor
                    .last_error()
                    .unwrap_or_else(|| "clean circuits request rejected".to_string()),
            ),
            Err(e) => NetworkProbeResult::failed(e.to_string()),
        };

        *self.last_renewal.lock() = Instant::now();
        *self.last_probe.write() = Some(probe.clone());
        if let Some(ref error) = probe.error {
            self.record_error(error.clone());
        }
        probe
    }
}

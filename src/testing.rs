//! Loopback fakes for tests: a Tor control port, a SOCKS5 proxy, the
//! status-check endpoint and a process executor that pretends to be Tor.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceConfig;
use crate::service::executor::{ExecuteRequest, ExecutionResult, LineCallback, ProcessExecutor};

pub const BOOTSTRAP_LINE: &str = "[notice] Bootstrapped 100% (done): Done";
pub const BIND_FAILURE_LINE: &str =
    "[warn] Could not bind to 127.0.0.1:9051: Address already in use. Is Tor already running?";

/// Fresh path under the temp dir; not created
pub fn scratch_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "torpool-test-{}-{}",
        name,
        uuid::Uuid::new_v4().simple()
    ))
}

pub fn service_config(password: &str) -> ServiceConfig {
    ServiceConfig {
        executable: PathBuf::from("tor"),
        control_password: password.to_string(),
        working_dir: std::env::temp_dir(),
        data_root: scratch_dir("data-root"),
        startup_timeout: 5,
        control_timeout: 5,
        probe_timeout: 5,
        stop_grace: 1,
        ..ServiceConfig::default()
    }
}

type CommandLog = Arc<Mutex<Vec<String>>>;

/// Minimal Tor control port
pub struct FakeControlServer {
    pub port: u16,
    commands: CommandLog,
    task: JoinHandle<()>,
}

impl FakeControlServer {
    pub async fn start(password: &str) -> Self {
        Self::bind(0, password, Arc::new(Mutex::new(Vec::new())))
            .await
            .unwrap()
    }

    async fn bind(port: u16, password: &str, commands: CommandLog) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let password = password.to_string();
        let log = commands.clone();

        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_control(socket, password.clone(), log.clone()));
            }
        });

        Ok(Self {
            port,
            commands,
            task,
        })
    }

    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        count_commands(&self.commands, command)
    }
}

impl Drop for FakeControlServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn count_commands(log: &CommandLog, command: &str) -> usize {
    log.lock().iter().filter(|c| c.as_str() == command).count()
}

async fn serve_control(socket: TcpStream, password: String, log: CommandLog) {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let expected_auth = format!("AUTHENTICATE \"{}\"", password);
    let mut authenticated = false;

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end().to_string();
        log.lock().push(line.clone());

        let (reply, close): (&str, bool) = if line.starts_with("AUTHENTICATE") {
            if line == expected_auth {
                authenticated = true;
                ("250 OK\r\n", false)
            } else {
                ("515 Authentication failed: Password did not match\r\n", true)
            }
        } else if line == "QUIT" {
            ("250 closing connection\r\n", true)
        } else if !authenticated {
            ("514 Authentication required.\r\n", true)
        } else if line == "SIGNAL NEWNYM" {
            ("250 OK\r\n", false)
        } else if line == "GETINFO version" {
            ("250-version=0.4.8.12\r\n250 OK\r\n", false)
        } else {
            ("510 Unrecognized command\r\n", false)
        };

        if write_half.write_all(reply.as_bytes()).await.is_err() || close {
            break;
        }
    }
}

/// No-auth SOCKS5 proxy supporting CONNECT
pub struct FakeSocksServer {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeSocksServer {
    pub async fn start() -> Self {
        Self::bind(0, Arc::new(AtomicUsize::new(0))).await.unwrap()
    }

    async fn bind(port: u16, connections: Arc<AtomicUsize>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let counter = connections.clone();

        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = serve_socks(socket).await;
                });
            }
        });

        Ok(Self {
            port,
            connections,
            task,
        })
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakeSocksServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_socks(mut client: TcpStream) -> std::io::Result<()> {
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;
    client.write_all(&[5, 0]).await?;

    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    let host = match request[3] {
        1 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        3 => {
            let len = client.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        4 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            std::net::Ipv6Addr::from(ip).to_string()
        }
        _ => return Ok(()),
    };
    let port = client.read_u16().await?;

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(_) => {
            client.write_all(&[5, 5, 0, 1, 0, 0, 0, 0, 0, 0]).await?;
            return Ok(());
        }
    };
    client.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await?;

    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

/// Serves the `{"IP": ..., "IsTor": ...}` status document
pub struct FakeStatusServer {
    pub port: u16,
    state: StatusState,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct StatusState {
    document: serde_json::Value,
    hits: Arc<AtomicUsize>,
    user_agents: Arc<Mutex<Vec<String>>>,
}

impl FakeStatusServer {
    pub const EXIT_IP: &'static str = "198.51.100.7";

    pub async fn start(is_tor: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = StatusState {
            document: serde_json::json!({ "IsTor": is_tor, "IP": Self::EXIT_IP }),
            hits: Arc::new(AtomicUsize::new(0)),
            user_agents: Arc::new(Mutex::new(Vec::new())),
        };

        let app = Router::new()
            .route("/api/ip", get(status_document))
            .with_state(state.clone());
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { port, state, task }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/api/ip", self.port)
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    /// User-Agent headers seen so far, in arrival order
    pub fn user_agents(&self) -> Vec<String> {
        self.state.user_agents.lock().clone()
    }
}

impl Drop for FakeStatusServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn status_document(
    State(state): State<StatusState>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if let Some(agent) = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
    {
        state.user_agents.lock().push(agent.to_string());
    }
    Json(state.document.clone())
}

enum FakeMode {
    /// Print the lines, then run until canceled or exit with the code
    Scripted {
        lines: Vec<String>,
        exit_code: Option<i32>,
    },
    /// Serve a control port and a SOCKS port on the requested ports
    Emulating { password: String },
}

/// [`ProcessExecutor`] that never spawns anything
pub struct FakeTorExecutor {
    mode: FakeMode,
    runs: AtomicUsize,
    last_request: Mutex<Option<ExecuteRequest>>,
    control_log: CommandLog,
    socks_connections: Arc<AtomicUsize>,
}

impl FakeTorExecutor {
    fn with_mode(mode: FakeMode) -> Self {
        Self {
            mode,
            runs: AtomicUsize::new(0),
            last_request: Mutex::new(None),
            control_log: Arc::new(Mutex::new(Vec::new())),
            socks_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn scripted(lines: Vec<String>) -> Self {
        Self::with_mode(FakeMode::Scripted {
            lines,
            exit_code: None,
        })
    }

    pub fn bootstrapping() -> Self {
        Self::scripted(bootstrap_script())
    }

    /// Fake Tor bound to the ports from its arguments; reports a bind failure when they are taken
    pub fn emulating(password: &str) -> Self {
        Self::with_mode(FakeMode::Emulating {
            password: password.to_string(),
        })
    }

    /// Exit with `code` after the script instead of waiting for cancellation
    pub fn exiting(mut self, code: i32) -> Self {
        if let FakeMode::Scripted {
            ref mut exit_code, ..
        } = self.mode
        {
            *exit_code = Some(code);
        }
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ExecuteRequest> {
        self.last_request.lock().clone()
    }

    /// Commands seen by every emulated control port
    pub fn control_count(&self, command: &str) -> usize {
        count_commands(&self.control_log, command)
    }

    pub fn socks_connections(&self) -> usize {
        self.socks_connections.load(Ordering::SeqCst)
    }

    async fn emulate(
        &self,
        password: &str,
        request: &ExecuteRequest,
        on_line: &LineCallback,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let control_port = port_argument(&request.args, "--ControlPort");
        let socks_port = port_argument(&request.args, "--SocksPort");
        on_line("[notice] Tor 0.4.8.12 running on Linux.");

        let control =
            FakeControlServer::bind(control_port, password, self.control_log.clone()).await;
        let socks = match &control {
            Ok(_) => Some(FakeSocksServer::bind(socks_port, self.socks_connections.clone()).await),
            Err(_) => None,
        };

        let (control, socks) = match (control, socks) {
            (Ok(control), Some(Ok(socks))) => (control, socks),
            (Ok(_), _) => return bind_failure(on_line, socks_port),
            (Err(_), _) => return bind_failure(on_line, control_port),
        };

        for line in bootstrap_script() {
            on_line(line.as_str());
        }
        cancel.cancelled().await;
        drop(control);
        drop(socks);
        killed()
    }
}

#[async_trait]
impl ProcessExecutor for FakeTorExecutor {
    async fn execute(
        &self,
        request: ExecuteRequest,
        on_line: LineCallback,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        self.runs.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request.clone());

        match &self.mode {
            FakeMode::Scripted { lines, exit_code } => {
                for line in lines {
                    on_line(line.as_str());
                    tokio::task::yield_now().await;
                }
                match exit_code {
                    Some(code) => ExecutionResult {
                        exit_code: Some(*code),
                        output: lines.clone(),
                        error: None,
                        killed: false,
                    },
                    None => {
                        cancel.cancelled().await;
                        killed()
                    }
                }
            }
            FakeMode::Emulating { password } => {
                self.emulate(password, &request, &on_line, &cancel).await
            }
        }
    }
}

fn bootstrap_script() -> Vec<String> {
    vec![
        "[notice] Bootstrapped 0% (starting): Starting".to_string(),
        "[notice] Bootstrapped 50% (loading_descriptors): Loading relay descriptors".to_string(),
        BOOTSTRAP_LINE.to_string(),
    ]
}

fn bind_failure(on_line: &LineCallback, port: u16) -> ExecutionResult {
    let line = format!(
        "[warn] Could not bind to 127.0.0.1:{}: Address already in use. Is Tor already running?",
        port
    );
    on_line(line.as_str());
    on_line("[err] Reading config failed--see warnings above.");
    ExecutionResult {
        exit_code: Some(1),
        output: vec![line],
        error: None,
        killed: false,
    }
}

fn killed() -> ExecutionResult {
    ExecutionResult {
        exit_code: None,
        killed: true,
        ..ExecutionResult::default()
    }
}

fn port_argument(args: &[String], flag: &str) -> u16 {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|p| p.parse().ok())
        .unwrap_or(0)
}

/// Two ports that were free a moment ago
pub fn free_ports() -> (u16, u16) {
    let a = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let b = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    (
        a.local_addr().unwrap().port(),
        b.local_addr().unwrap().port(),
    )
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    check()
}

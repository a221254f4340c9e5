//! Control channel between the running daemon and one-off commands
//!
//! `start` binds a loopback listener and publishes its port and a random
//! token in `<sessions_dir>/control.json`. `run-now`, `status` and `stop`
//! look for that file first and, when a daemon answers, have it do the work
//! so its in-flight guard and rate windows stay authoritative.
//!
//! The wire format is one JSON request line answered by one JSON response
//! line per connection.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::scheduler::{JobScheduler, SchedulerStatus, WorkOutcome};
use crate::session::{FileLock, RepositoryError, SessionRepository};

/// File in the sessions dir naming the daemon's endpoint
pub const CONTROL_FILE: &str = "control.json";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Control channel errors
#[derive(Debug, Error)]
pub enum ControlError {
    /// Another daemon holds the sessions dir
    #[error("A daemon is already serving {0}")]
    AlreadyRunning(PathBuf),

    /// The daemon answered with an error
    #[error("Daemon rejected the request: {0}")]
    Rejected(String),

    /// The daemon closed the connection without answering
    #[error("Daemon closed the control connection")]
    Closed,

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Malformed control message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// What a client asks the daemon to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    RunNow { profile: Option<String> },
    Status,
    Stop,
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlRequest {
    token: String,
    #[serde(flatten)]
    command: ControlCommand,
}

/// The daemon's answer to one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ControlResponse {
    Outcomes { outcomes: Vec<(String, WorkOutcome)> },
    Status { status: SchedulerStatus },
    Stopping,
    Error { message: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct Endpoint {
    port: u16,
    token: String,
    pid: u32,
}

/// Daemon side of the channel
///
/// Holds the daemon lock for as long as it lives and removes the endpoint
/// file on drop.
pub struct ControlServer {
    listener: TcpListener,
    token: String,
    endpoint_path: PathBuf,
    _lock: FileLock,
}

impl ControlServer {
    /// Claims the sessions dir for this process and publishes the endpoint
    pub async fn bind(repository: &SessionRepository) -> Result<Self, ControlError> {
        let lock = repository
            .try_lock_daemon()?
            .ok_or_else(|| ControlError::AlreadyRunning(repository.dir().to_path_buf()))?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = Endpoint {
            port: listener.local_addr()?.port(),
            token: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
        };

        let endpoint_path = repository.dir().join(CONTROL_FILE);
        let mut tmp = tempfile::Builder::new()
            .prefix(".control-")
            .tempfile_in(repository.dir())?;
        tmp.write_all(&serde_json::to_vec(&endpoint)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&endpoint_path).map_err(|e| e.error)?;

        tracing::info!(port = endpoint.port, "Control channel listening");
        Ok(Self {
            listener,
            token: endpoint.token,
            endpoint_path,
            _lock: lock,
        })
    }

    pub fn port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Answers requests until `shutdown` fires
    ///
    /// A `stop` request cancels `shutdown` itself; the caller then stops the
    /// scheduler.
    pub async fn serve(self, scheduler: JobScheduler, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let scheduler = scheduler.clone();
                        let shutdown = shutdown.clone();
                        let token = self.token.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle(stream, &token, &scheduler, &shutdown).await {
                                tracing::warn!(%peer, "Control request failed: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Control accept failed: {}", e),
                },
            }
        }
        tracing::debug!("Control channel closed");
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.endpoint_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.endpoint_path.display(), "Failed to remove control file: {}", e);
            }
        }
    }
}

async fn handle(
    stream: TcpStream,
    token: &str,
    scheduler: &JobScheduler,
    shutdown: &CancellationToken,
) -> Result<(), ControlError> {
    let (read, mut write) = stream.into_split();
    let mut line = String::new();
    let n = tokio::time::timeout(REQUEST_TIMEOUT, BufReader::new(read).read_line(&mut line))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no request received"))??;
    if n == 0 {
        // Liveness check from ControlClient::connect
        return Ok(());
    }

    let response = match serde_json::from_str::<ControlRequest>(&line) {
        Ok(request) if request.token != token => ControlResponse::Error {
            message: "invalid token".to_string(),
        },
        Ok(request) => execute(request.command, scheduler, shutdown).await,
        Err(e) => ControlResponse::Error {
            message: format!("malformed request: {}", e),
        },
    };

    let mut out = serde_json::to_vec(&response)?;
    out.push(b'\n');
    write.write_all(&out).await?;
    write.shutdown().await?;
    Ok(())
}

async fn execute(
    command: ControlCommand,
    scheduler: &JobScheduler,
    shutdown: &CancellationToken,
) -> ControlResponse {
    tracing::debug!(?command, "Control request");
    match command {
        ControlCommand::RunNow { profile } => match scheduler.run_now(profile.as_deref(), Utc::now()) {
            Ok(tick) => ControlResponse::Outcomes {
                outcomes: tick.join().await,
            },
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        },
        ControlCommand::Status => ControlResponse::Status {
            status: scheduler.status(Utc::now()),
        },
        ControlCommand::Stop => {
            tracing::info!("Stop requested over the control channel");
            shutdown.cancel();
            ControlResponse::Stopping
        }
    }
}

/// Client side of the channel
#[derive(Debug)]
pub struct ControlClient {
    addr: SocketAddr,
    token: String,
}

impl ControlClient {
    /// Finds the daemon serving `sessions_dir`
    ///
    /// Returns `Ok(None)` when no daemon is running: no endpoint file, or a
    /// leftover one whose port no longer answers.
    pub async fn connect(sessions_dir: &Path) -> Result<Option<Self>, ControlError> {
        let content = match std::fs::read(sessions_dir.join(CONTROL_FILE)) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let endpoint: Endpoint = serde_json::from_slice(&content)?;
        let addr = SocketAddr::from(([127, 0, 0, 1], endpoint.port));

        match TcpStream::connect(addr).await {
            Ok(_) => Ok(Some(Self {
                addr,
                token: endpoint.token,
            })),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::debug!(pid = endpoint.pid, "Ignoring stale control file");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Sends one command and waits for its answer
    ///
    /// `run_now` answers only after the daemon's work units finish.
    pub async fn send(&self, command: ControlCommand) -> Result<ControlResponse, ControlError> {
        let stream = TcpStream::connect(self.addr).await?;
        let (read, mut write) = stream.into_split();

        let request = ControlRequest {
            token: self.token.clone(),
            command,
        };
        let mut out = serde_json::to_vec(&request)?;
        out.push(b'\n');
        write.write_all(&out).await?;

        let mut line = String::new();
        if BufReader::new(read).read_line(&mut line).await? == 0 {
            return Err(ControlError::Closed);
        }
        match serde_json::from_str(&line)? {
            ControlResponse::Error { message } => Err(ControlError::Rejected(message)),
            response => Ok(response),
        }
    }
}

use crate::config::Config;
use crate::daemon::protocol::{DaemonRequest, DaemonResponse};
use crate::error::{PilotError, Result};
use crate::policy::SafetyPolicy;
use crate::transaction::Orchestrator;
use colored::*;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

/// Serves the orchestrator over a Unix socket
pub struct DaemonServer {
    socket_path: PathBuf,
    pid_path: PathBuf,
    config: Config,
    orchestrator: Arc<Orchestrator>,
    start_time: Instant,
    shutdown: Arc<Notify>,
}

impl DaemonServer {
    pub fn new(config: Config, orchestrator: Orchestrator) -> Self {
        Self {
            socket_path: config.socket_path(),
            pid_path: config.state_dir.join("nixpilot.pid"),
            config,
            orchestrator: Arc::new(orchestrator),
            start_time: Instant::now(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept clients until a Shutdown request or SIGINT, then drain the queue
    pub async fn start(&self) -> Result<()> {
        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Err(PilotError::Daemon(format!(
                    "another daemon is listening on {}",
                    self.socket_path.display()
                )));
            }
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| PilotError::Daemon(format!("failed to bind socket: {}", e)))?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        std::fs::write(&self.pid_path, std::process::id().to_string())?;

        println!("{} Daemon started.", "[OK]".green().bold());
        println!("  Socket: {}", self.socket_path.display());
        tracing::info!(socket = %self.socket_path.display(), pid = std::process::id(), "daemon listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let orchestrator = Arc::clone(&self.orchestrator);
                        let config = self.config.clone();
                        let shutdown = Arc::clone(&self.shutdown);
                        let start_time = self.start_time;
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_client(stream, orchestrator, config, start_time, shutdown).await {
                                tracing::warn!(error = %e, "client connection failed");
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                },
                _ = self.shutdown.notified() => break,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("interrupt received");
                    break;
                }
            }
        }

        println!("{} Draining queued transactions...", "[..]".yellow());
        self.orchestrator.shutdown().await;
        self.cleanup()?;
        println!("{} Daemon stopped.", "[BYE]".cyan());
        Ok(())
    }

    async fn handle_client(
        stream: UnixStream,
        orchestrator: Arc<Orchestrator>,
        config: Config,
        start_time: Instant,
        shutdown: Arc<Notify>,
    ) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        let response = match DaemonRequest::from_json(&line) {
            Ok(request) => Self::dispatch(request, &orchestrator, &config, start_time, &shutdown).await,
            Err(e) => DaemonResponse::Error {
                message: format!("malformed request: {}", e),
            },
        };

        let mut json = response.to_json()?;
        json.push('\n');
        writer.write_all(json.as_bytes()).await?;
        Ok(())
    }

    async fn dispatch(
        request: DaemonRequest,
        orchestrator: &Orchestrator,
        config: &Config,
        start_time: Instant,
        shutdown: &Notify,
    ) -> DaemonResponse {
        let result = match request {
            DaemonRequest::Submit { request, wait } => match orchestrator.submit(request) {
                Ok(submission) if wait => submission.wait().await.map(|transaction| DaemonResponse::Finished {
                    transaction: Box::new(transaction),
                }),
                Ok(submission) => Ok(DaemonResponse::Accepted {
                    tx_id: submission.tx_id,
                }),
                Err(e) => Err(e),
            },
            DaemonRequest::Status => orchestrator
                .engine()
                .halt_latch()
                .reason()
                .map(|halted| DaemonResponse::Status {
                    current: orchestrator.progress(),
                    pending: orchestrator.pending(),
                    halted,
                }),
            DaemonRequest::Cancel { tx_id } => orchestrator
                .cancel(&tx_id)
                .map(|tx_id| DaemonResponse::Cancelling { tx_id }),
            DaemonRequest::Reload => {
                match SafetyPolicy::load(&config.policy_path, &config.config_root, &config.state_dir) {
                    Ok(policy) => orchestrator.reload_policy(policy).await.map(|reload| {
                        DaemonResponse::Reloaded {
                            old_digest: reload.old_digest,
                            new_digest: reload.new_digest,
                        }
                    }),
                    Err(e) => Err(e),
                }
            }
            DaemonRequest::Resume => orchestrator
                .resume()
                .map(|cleared| DaemonResponse::Resumed { cleared }),
            DaemonRequest::Rollback { target } => orchestrator
                .rollback(target)
                .await
                .map(|report| DaemonResponse::RolledBack { report }),
            DaemonRequest::Ping => Ok(DaemonResponse::Pong {
                uptime_seconds: start_time.elapsed().as_secs(),
                pending: orchestrator.pending(),
            }),
            DaemonRequest::Shutdown => {
                shutdown.notify_one();
                Ok(DaemonResponse::ShuttingDown)
            }
        };

        result.unwrap_or_else(|e| DaemonResponse::Error {
            message: e.to_string(),
        })
    }

    fn cleanup(&self) -> Result<()> {
        for path in [&self.socket_path, &self.pid_path] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// Sends one request per connection
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub fn is_running(&self) -> bool {
        self.socket_path.exists()
    }

    pub async fn send_request(&self, request: &DaemonRequest) -> Result<DaemonResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            PilotError::Daemon(format!(
                "failed to connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        let mut json = request.to_json()?;
        json.push('\n');
        stream.write_all(json.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.trim().is_empty() {
            return Err(PilotError::Daemon("daemon closed the connection".to_string()));
        }
        Ok(DaemonResponse::from_json(&line)?)
    }
}

//! Owns the single FastCGI worker process for this bridge instance.
//!
//! The worker is launched lazily on first use, relaunched when it has
//! exited, and terminated exactly once on shutdown (or on drop).

use crate::session::query_values;
use fcgx_core::config::{ReadinessMode, WorkerConfig};
use fcgx_core::record::{FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS};
use fcgx_core::{Error, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Workers only ever listen on loopback.
pub const WORKER_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

const PROBE_BACKOFF_START: Duration = Duration::from_millis(10);
const PROBE_BACKOFF_MAX: Duration = Duration::from_millis(200);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Command line for a worker: `<script> -b 127.0.0.1:<port> [-c <ini>] (-d <name>=<value>)*`.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub ini: Option<PathBuf>,
    pub options: BTreeMap<String, String>,
}

impl WorkerCommand {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            program: config.script.clone(),
            ini: config.ini.clone(),
            options: config.options.clone(),
        }
    }

    pub fn args(&self, port: u16) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-b"),
            OsString::from(format!("{WORKER_HOST}:{port}")),
        ];
        if let Some(ini) = &self.ini {
            args.push("-c".into());
            args.push(ini.clone().into_os_string());
        }
        for (name, value) in &self.options {
            args.push("-d".into());
            args.push(format!("{name}={value}").into());
        }
        args
    }
}

/// Starts a worker process listening on `port`.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, command: &WorkerCommand, port: u16) -> std::io::Result<Child>;
}

/// Launches the configured executable directly.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, command: &WorkerCommand, port: u16) -> std::io::Result<Child> {
        Command::new(&command.program)
            .args(command.args(port))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub pid: Option<u32>,
    pub port: u16,
    pub ready: bool,
}

struct WorkerHandle {
    child: Child,
    pid: Option<u32>,
    port: u16,
    ready: bool,
}

impl WorkerHandle {
    fn addr(&self) -> SocketAddr {
        SocketAddr::from((WORKER_HOST, self.port))
    }

    async fn terminate(&mut self) {
        info!(pid = ?self.pid, port = self.port, "stopping FastCGI worker");
        if let Err(err) = self.child.start_kill() {
            debug!(pid = ?self.pid, error = %err, "worker already gone");
        }
        match timeout(KILL_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => debug!(pid = ?self.pid, %status, "worker reaped"),
            Ok(Err(err)) => warn!(pid = ?self.pid, error = %err, "failed to reap worker"),
            Err(_) => warn!(pid = ?self.pid, "worker did not exit after kill"),
        }
    }
}

pub struct Supervisor {
    config: WorkerConfig,
    command: WorkerCommand,
    launcher: Arc<dyn WorkerLauncher>,
    worker: Mutex<Option<WorkerHandle>>,
    launches: AtomicU64,
}

impl Supervisor {
    pub fn new(config: WorkerConfig) -> Self {
        Self::with_launcher(config, Arc::new(ProcessLauncher))
    }

    pub fn with_launcher(config: WorkerConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let command = WorkerCommand::from_config(&config);
        Self {
            config,
            command,
            launcher,
            worker: Mutex::new(None),
            launches: AtomicU64::new(0),
        }
    }

    /// Return the worker address, launching (or relaunching) it first when
    /// needed. Concurrent callers wait on the same launch.
    pub async fn ensure_running(&self) -> Result<SocketAddr> {
        let mut guard = self.worker.lock().await;
        if let Some(handle) = guard.as_mut() {
            match handle.child.try_wait() {
                Ok(None) => return Ok(handle.addr()),
                Ok(Some(status)) => {
                    warn!(pid = ?handle.pid, %status, "FastCGI worker exited; relaunching");
                    *guard = None;
                }
                Err(err) => {
                    warn!(pid = ?handle.pid, error = %err, "cannot poll FastCGI worker; assuming alive");
                    return Ok(handle.addr());
                }
            }
        }

        let handle = self.launch().await?;
        let addr = handle.addr();
        *guard = Some(handle);
        Ok(addr)
    }

    async fn launch(&self) -> Result<WorkerHandle> {
        let port = match self.config.port {
            Some(port) => port,
            None => find_free_port(self.config.port_search_start, self.config.port_search_limit)?,
        };
        let child = self
            .launcher
            .launch(&self.command, port)
            .map_err(|source| Error::Spawn {
                program: self.command.program.clone(),
                source,
            })?;
        self.launches.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        info!(pid = ?pid, port, program = %self.command.program.display(), "FastCGI worker launched");

        let mut handle = WorkerHandle {
            child,
            pid,
            port,
            ready: false,
        };
        if let Err(err) = self.wait_ready(&mut handle).await {
            handle.terminate().await;
            return Err(err);
        }
        handle.ready = true;
        Ok(handle)
    }

    async fn wait_ready(&self, handle: &mut WorkerHandle) -> Result<()> {
        match self.config.readiness {
            ReadinessMode::Delay => {
                sleep(self.config.readiness_delay()).await;
                Ok(())
            }
            ReadinessMode::Probe => self.probe_ready(handle).await,
        }
    }

    async fn probe_ready(&self, handle: &mut WorkerHandle) -> Result<()> {
        let addr = handle.addr();
        let deadline = Instant::now() + self.config.probe_timeout();
        let mut backoff = PROBE_BACKOFF_START;
        loop {
            if let Some(status) = handle.child.try_wait()? {
                return Err(Error::Spawn {
                    program: self.command.program.clone(),
                    source: std::io::Error::other(format!(
                        "worker exited during startup: {status}"
                    )),
                });
            }
            match query_values(addr, &[FCGI_MAX_CONNS, FCGI_MAX_REQS, FCGI_MPXS_CONNS]).await {
                Ok(values) => {
                    debug!(%addr, ?values, "FastCGI worker answered GetValues");
                    return Ok(());
                }
                Err(err) if Instant::now() >= deadline => return Err(err),
                Err(err) => {
                    trace!(%addr, error = %err, "FastCGI worker not ready yet");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(PROBE_BACKOFF_MAX);
                }
            }
        }
    }

    /// Address of the current worker, if one has been launched.
    pub async fn address(&self) -> Option<SocketAddr> {
        self.worker.lock().await.as_ref().map(WorkerHandle::addr)
    }

    pub async fn status(&self) -> Option<WorkerStatus> {
        self.worker.lock().await.as_ref().map(|h| WorkerStatus {
            pid: h.pid,
            port: h.port,
            ready: h.ready,
        })
    }

    /// Number of processes launched over this supervisor's lifetime.
    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Terminate the worker. Returns `false` when there was none to stop.
    pub async fn shutdown(&self) -> bool {
        let handle = self.worker.lock().await.take();
        match handle {
            Some(mut handle) => {
                handle.terminate().await;
                true
            }
            None => false,
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().as_mut() {
            debug!(pid = ?handle.pid, "killing FastCGI worker on drop");
            let _ = handle.child.start_kill();
        }
    }
}

/// First loopback port from `start` that can currently be bound, trying at
/// most `limit` ports.
pub fn find_free_port(start: u16, limit: u32) -> Result<u16> {
    let start = start.max(1);
    let mut port = start;
    let mut attempts = 0u32;
    while attempts < limit {
        attempts += 1;
        match std::net::TcpListener::bind((WORKER_HOST, port)) {
            Ok(listener) => {
                drop(listener);
                return Ok(port);
            }
            Err(err) => trace!(port, error = %err, "port unavailable"),
        }
        port = match port.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }
    Err(Error::PortSearchExhausted { start, attempts })
}

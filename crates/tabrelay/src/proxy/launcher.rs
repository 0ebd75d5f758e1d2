//! Starting and stopping relay processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::{BridgeError, BridgeResult};
use crate::transport::ConnectionMode;

/// How long to wait for a killed relay to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a relay needs to serve one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub target_url: String,
    pub hub_url: String,
    pub port: u16,
    pub mode: ConnectionMode,
}

/// A running relay.
#[async_trait]
pub trait RelayProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    fn is_running(&mut self) -> bool;

    /// Stop the relay and wait (bounded) for it to go away.
    async fn terminate(&mut self) -> BridgeResult<()>;
}

/// Starts relays.
#[async_trait]
pub trait RelayLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> BridgeResult<Box<dyn RelayProcess>>;
}

/// Launches relays by re-running this binary as `tabrelay gateway`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    /// Launcher for the currently running executable.
    pub fn current_exe() -> BridgeResult<Self> {
        let program = std::env::current_exe().map_err(|e| {
            BridgeError::lifecycle(format!("cannot locate the current executable: {e}"))
        })?;
        Ok(Self::new(program))
    }

    /// Arguments placed before the subcommand, e.g. `--config <path>`.
    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    pub fn command_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend([
            "gateway".to_string(),
            "--port".to_string(),
            spec.port.to_string(),
            "--target-url".to_string(),
            spec.target_url.clone(),
            "--hub-url".to_string(),
            spec.hub_url.clone(),
            "--mode".to_string(),
            spec.mode.to_string(),
        ]);
        args
    }
}

#[async_trait]
impl RelayLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> BridgeResult<Box<dyn RelayProcess>> {
        let args = self.command_args(spec);
        debug!("launching relay: {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::lifecycle(format!(
                    "failed to start relay for {}: {e}",
                    spec.target_url
                ))
            })?;

        let port = spec.port;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("relay[{port}]: {line}");
                }
            });
        }

        let pid = child.id();
        info!(
            "started relay for {} on port {port} (pid {})",
            spec.target_url,
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        );
        Ok(Box::new(ChildRelay { child, pid }))
    }
}

/// A relay running as a child process.
pub struct ChildRelay {
    child: Child,
    pid: Option<u32>,
}

#[async_trait]
impl RelayProcess for ChildRelay {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self) -> BridgeResult<()> {
        if let Err(e) = self.child.start_kill()
            && self.is_running()
        {
            return Err(BridgeError::lifecycle(format!(
                "failed to kill relay process: {e}"
            )));
        }

        // Reap so no zombie is left behind.
        match tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!("relay process {:?} exited with {status}", self.pid),
            Ok(Err(e)) => warn!("error waiting for relay process {:?}: {e}", self.pid),
            Err(_) => warn!("timed out waiting for relay process {:?} to exit", self.pid),
        }
        Ok(())
    }
}

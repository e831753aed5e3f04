// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle of the continuous runner process.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default time a terminated child gets to exit before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Starts and restarts the continuous runner.
#[async_trait]
pub trait ContinuousSupervisor: Send + Sync {
    /// Start the runner unless it is already running.
    async fn start(&self) -> Result<()>;

    /// Terminate the current runner, if any, and start a new one.
    async fn restart(&self) -> Result<()>;

    /// Number of restarts performed so far.
    fn restarts(&self) -> u64;

    /// Terminate the runner without starting a new one.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Supervises the continuous runner as a child process.
///
/// The child is never restarted when it exits on its own; only
/// [`restart`](ContinuousSupervisor::restart) spawns a replacement.
pub struct ProcessSupervisor {
    program: PathBuf,
    args: Vec<String>,
    grace_period: Duration,
    child: Mutex<Option<Child>>,
    restarts: AtomicU64,
}

impl ProcessSupervisor {
    /// Supervise `program args..`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            grace_period: DEFAULT_GRACE_PERIOD,
            child: Mutex::new(None),
            restarts: AtomicU64::new(0),
        }
    }

    /// Supervise `<current executable> continuous`.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, vec!["continuous".to_string()]))
    }

    /// Set how long a terminated child may take to exit.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// PID of the current child, if it is still running.
    pub async fn pid(&self) -> Option<u32> {
        let mut child = self.child.lock().await;
        let c = child.as_mut()?;
        if matches!(c.try_wait(), Ok(None)) {
            c.id()
        } else {
            None
        }
    }

    fn spawn(&self) -> Result<Child> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Supervisor(format!(
                    "failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })?;
        info!(program = %self.program.display(), pid = ?child.id(), "Continuous runner started");
        Ok(child)
    }

    async fn terminate(&self, mut child: Child) {
        let Some(pid) = child.id() else {
            debug!("Continuous runner already exited");
            return;
        };

        let pid = Pid::from_raw(pid as i32);
        match signal::kill(pid, Signal::SIGTERM) {
            Ok(()) => debug!(pid = pid.as_raw(), "Sent SIGTERM to continuous runner"),
            Err(nix::errno::Errno::ESRCH) => return,
            Err(e) => warn!(pid = pid.as_raw(), error = %e, "Failed to send SIGTERM"),
        }

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) => debug!(pid = pid.as_raw(), %status, "Continuous runner exited"),
            Ok(Err(e)) => warn!(
                pid = pid.as_raw(),
                error = %e,
                "Failed to wait for continuous runner"
            ),
            Err(_) => {
                warn!(pid = pid.as_raw(), "Continuous runner ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    warn!(pid = pid.as_raw(), error = %e, "Failed to kill continuous runner");
                }
            }
        }
    }
}

#[async_trait]
impl ContinuousSupervisor for ProcessSupervisor {
    async fn start(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Some(current) = child.as_mut()
            && matches!(current.try_wait(), Ok(None))
        {
            debug!("Continuous runner already running");
            return Ok(());
        }
        *child = Some(self.spawn()?);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Some(previous) = child.take() {
            self.terminate(previous).await;
        }
        *child = Some(self.spawn()?);
        let restarts = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(restarts, "Continuous runner restarted");
        Ok(())
    }

    fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(previous) = self.child.lock().await.take() {
            self.terminate(previous).await;
        }
        Ok(())
    }
}

//! Named background-job records and the OS process operations behind them.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use roomrank_core::JobState;
use roomrank_storage::StateStore;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};
use thiserror::Error;
use tracing::{debug, info, warn};

/// How often `terminate` re-checks a signalled process.
const TERMINATE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("job `{job}` (pid {pid}) exceeded its ceiling after {elapsed_secs}s and was killed")]
    Timeout {
        job: String,
        pid: u32,
        elapsed_secs: i64,
    },
    #[error("job `{job}` (pid {pid}) died without clearing its state")]
    Vanished { job: String, pid: u32 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SupervisorError::Timeout { .. })
    }
}

#[async_trait]
pub trait ProcessControl: Send + Sync {
    fn current_pid(&self) -> u32;

    fn is_alive(&self, pid: u32) -> bool;

    /// SIGTERM, wait up to `grace`, then force-kill. Returns whether the process is gone.
    async fn terminate(&self, pid: u32, grace: Duration) -> bool;

    /// Start this executable with `args` in its own process group, detached from our terminal.
    fn spawn_detached(&self, args: &[String]) -> Result<u32>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemProcessControl {
    log_file: Option<PathBuf>,
}

impl SystemProcessControl {
    /// Send stdout and stderr of spawned processes to `path` (appending) instead of discarding.
    pub fn with_log_file(path: impl Into<PathBuf>) -> Self {
        Self {
            log_file: Some(path.into()),
        }
    }

    fn output(&self) -> Result<(Stdio, Stdio)> {
        let Some(path) = &self.log_file else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        let err = file
            .try_clone()
            .with_context(|| format!("cloning handle for {}", path.display()))?;
        Ok((Stdio::from(file), Stdio::from(err)))
    }

    fn signal(pid: u32, signal: Signal) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) => process.kill_with(signal).unwrap_or_else(|| process.kill()),
            None => false,
        }
    }
}

#[async_trait]
impl ProcessControl for SystemProcessControl {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn is_alive(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    async fn terminate(&self, pid: u32, grace: Duration) -> bool {
        if !self.is_alive(pid) {
            return true;
        }
        Self::signal(pid, Signal::Term);
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !self.is_alive(pid) {
                return true;
            }
            tokio::time::sleep(TERMINATE_POLL).await;
        }
        warn!(pid, "process ignored SIGTERM; force-killing");
        Self::signal(pid, Signal::Kill);
        tokio::time::sleep(TERMINATE_POLL).await;
        !self.is_alive(pid)
    }

    fn spawn_detached(&self, args: &[String]) -> Result<u32> {
        let exe = std::env::current_exe().context("locating current executable")?;
        let (stdout, stderr) = self.output()?;
        let mut command = Command::new(&exe);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .with_context(|| format!("spawning {} {}", exe.display(), args.join(" ")))?;
        let pid = child.id();
        // Reap the child when it exits so it never lingers as a zombie under us.
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        debug!(pid, ?args, "spawned detached process");
        Ok(pid)
    }
}

/// Durable `{pid, parent_pid, start_time}` records keyed by job name.
#[derive(Clone)]
pub struct JobRegistry {
    state: StateStore,
    process: Arc<dyn ProcessControl>,
}

impl JobRegistry {
    pub fn new(state: StateStore, process: Arc<dyn ProcessControl>) -> Self {
        Self { state, process }
    }

    fn key(name: &str) -> String {
        format!("jobs/{name}")
    }

    pub fn process(&self) -> &Arc<dyn ProcessControl> {
        &self.process
    }

    pub async fn register(&self, name: &str, job: &JobState) -> Result<()> {
        self.state.write(&Self::key(name), job).await
    }

    /// Remove the record only while it still belongs to `pid`.
    ///
    /// A later job may have registered under the same name; its record is left alone.
    pub async fn clear(&self, name: &str, pid: u32) -> Result<bool> {
        match self.get(name).await? {
            Some(job) if job.pid == pid => self.state.remove(&Self::key(name)).await,
            Some(job) => {
                debug!(job = name, owner = job.pid, pid, "record owned by another process");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub async fn get(&self, name: &str) -> Result<Option<JobState>> {
        self.state.read(&Self::key(name)).await
    }

    pub async fn is_alive(&self, name: &str) -> Result<bool> {
        Ok(self
            .get(name)
            .await?
            .is_some_and(|job| self.process.is_alive(job.pid)))
    }

    pub async fn elapsed(&self, name: &str) -> Result<Option<chrono::Duration>> {
        Ok(self.get(name).await?.map(|job| Utc::now() - job.start_time))
    }

    /// Block until the job clears its record.
    ///
    /// A record whose pid is gone is a liveness failure. A job older than `ceiling` is
    /// terminated and reported as a timeout.
    pub async fn wait_for(
        &self,
        name: &str,
        ceiling: Duration,
        poll: Duration,
        kill_grace: Duration,
    ) -> Result<(), SupervisorError> {
        let ceiling = chrono::Duration::from_std(ceiling)
            .context("supervisor ceiling out of range")?;
        loop {
            let Some(job) = self.get(name).await? else {
                debug!(job = name, "job cleared its state");
                return Ok(());
            };
            if !self.process.is_alive(job.pid) {
                // The job may have exited cleanly between the read and the liveness check.
                if self.get(name).await?.is_none() {
                    return Ok(());
                }
                return Err(SupervisorError::Vanished {
                    job: name.to_string(),
                    pid: job.pid,
                });
            }
            let elapsed = Utc::now() - job.start_time;
            if elapsed > ceiling {
                let killed = self.process.terminate(job.pid, kill_grace).await;
                info!(job = name, pid = job.pid, killed, "stalled job terminated");
                self.clear(name, job.pid).await?;
                return Err(SupervisorError::Timeout {
                    job: name.to_string(),
                    pid: job.pid,
                    elapsed_secs: elapsed.num_seconds(),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }
}

//! Job scheduler backed by OS child processes.
//!
//! Each job runs its entry script under the configured interpreter with
//! `kill_on_drop(true)`, a cleared environment replaced by the job's own,
//! and piped stdout/stderr. A per-run monitor task owns the child, waits for
//! it to exit (or kills it when stopped), and broadcasts a [`JobExit`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::process::Command;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{BoxFuture, JobExit, JobOutput, JobScheduler, RunId};
use crate::control::{CONTROL_ENV, JOB_ENV};
use crate::models::module::JobSpec;
use crate::{AppError, Result};

/// Script evaluated by the interpreter.
///
/// Exposes `screepsLauncher.terminate()` to module code, reports unhandled
/// rejections instead of dying, and loads the entry point passed as the
/// first argument.
pub const BOOTSTRAP: &str = "\
const net = require('net');\
global.screepsLauncher = {\
  terminate() {\
    const endpoint = process.env.LAUNCHER_CONTROL;\
    if (!endpoint) return;\
    const request = JSON.stringify({ command: 'terminate', job: process.env.LAUNCHER_JOB }) + '\\n';\
    const socket = net.createConnection(endpoint, () => socket.end(request));\
    socket.on('error', err => console.error(err));\
  },\
};\
process.on('unhandledRejection', err => console.error(err));\
require(process.argv[1]);";

/// Capacity of the exit notification channel.
const EXIT_CHANNEL_CAPACITY: usize = 256;

struct RunningJob {
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
}

struct JobSlot {
    spec: JobSpec,
    run: Option<RunningJob>,
}

/// Scheduler that runs every job as a child process of the launcher.
pub struct ProcessScheduler {
    runtime: String,
    control: Option<PathBuf>,
    jobs: Mutex<HashMap<String, JobSlot>>,
    exit_tx: broadcast::Sender<JobExit>,
    next_run: AtomicU64,
}

impl ProcessScheduler {
    /// Construct a scheduler running entry scripts with `runtime` (e.g. `node`).
    #[must_use]
    pub fn new(runtime: impl Into<String>) -> Self {
        let (exit_tx, _) = broadcast::channel(EXIT_CHANNEL_CAPACITY);
        Self {
            runtime: runtime.into(),
            control: None,
            jobs: Mutex::new(HashMap::new()),
            exit_tx,
            next_run: AtomicU64::new(1),
        }
    }

    /// Tell every job where the launcher's control socket is.
    #[must_use]
    pub fn with_control(mut self, endpoint: impl Into<PathBuf>) -> Self {
        self.control = Some(endpoint.into());
        self
    }

    fn command(&self, spec: &JobSpec) -> Command {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("-e")
            .arg(BOOTSTRAP)
            .arg(&spec.entry_point)
            .env_clear()
            .envs(&spec.environment)
            .env(JOB_ENV, &spec.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(control) = &self.control {
            cmd.env(CONTROL_ENV, control);
        }
        cmd
    }

    async fn start_job(&self, name: &str) -> Result<JobOutput> {
        let mut jobs = self.jobs.lock().await;
        let slot = jobs
            .get_mut(name)
            .ok_or_else(|| AppError::Scheduler(format!("job {name} is not registered")))?;

        if slot
            .run
            .as_ref()
            .is_some_and(|running| !running.monitor.is_finished())
        {
            return Err(AppError::Scheduler(format!("job {name} is already running")));
        }

        let mut child = self
            .command(&slot.spec)
            .spawn()
            .map_err(|err| AppError::Scheduler(format!("failed to spawn {name}: {err}")))?;

        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        info!(
            job = name,
            run,
            pid = child.id().unwrap_or(0),
            "job process spawned"
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cancel = CancellationToken::new();
        let monitor = monitor_exit(
            name.to_owned(),
            run,
            child,
            self.exit_tx.clone(),
            cancel.clone(),
        );
        slot.run = Some(RunningJob { cancel, monitor });

        Ok(JobOutput {
            run,
            stdout: stdout.map(|s| Box::pin(s) as super::OutputStream),
            stderr: stderr.map(|s| Box::pin(s) as super::OutputStream),
        })
    }

    async fn halt(name: &str, running: Option<RunningJob>) -> Result<()> {
        let Some(running) = running else {
            return Ok(());
        };
        running.cancel.cancel();
        running
            .monitor
            .await
            .map_err(|err| AppError::Scheduler(format!("monitor for {name} failed: {err}")))
    }
}

impl JobScheduler for ProcessScheduler {
    fn add(&self, spec: JobSpec) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut jobs = self.jobs.lock().await;
            if jobs.contains_key(&spec.name) {
                return Err(AppError::Scheduler(format!(
                    "job {} is already registered",
                    spec.name
                )));
            }
            jobs.insert(spec.name.clone(), JobSlot { spec, run: None });
            Ok(())
        })
    }

    fn start<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<JobOutput>> {
        Box::pin(self.start_job(name))
    }

    fn stop<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let running = {
                let mut jobs = self.jobs.lock().await;
                let slot = jobs
                    .get_mut(name)
                    .ok_or_else(|| AppError::Scheduler(format!("job {name} is not registered")))?;
                slot.run.take()
            };
            Self::halt(name, running).await
        })
    }

    fn remove<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let slot = self
                .jobs
                .lock()
                .await
                .remove(name)
                .ok_or_else(|| AppError::Scheduler(format!("job {name} is not registered")))?;
            Self::halt(name, slot.run).await
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<JobExit> {
        self.exit_tx.subscribe()
    }
}

/// Spawn the task that owns `child` until it exits.
///
/// Cancelling `cancel` kills the process. Either way exactly one
/// [`JobExit`] is broadcast once the process is gone.
fn monitor_exit(
    name: String,
    run: RunId,
    mut child: tokio::process::Child,
    exit_tx: broadcast::Sender<JobExit>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let code = tokio::select! {
            result = child.wait() => match result {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(job = name, %err, "error waiting for job process");
                    None
                }
            },
            () = cancel.cancelled() => {
                if let Err(err) = child.kill().await {
                    warn!(job = name, %err, "failed to kill job process");
                }
                None
            }
        };

        info!(job = name, run, ?code, "job process exited");
        // No subscribers simply means nobody is supervising.
        let _ = exit_tx.send(JobExit { name, run, code });
    })
}

//! Job scheduling abstraction.
//!
//! The [`JobScheduler`] trait decouples the module manager from whatever
//! actually runs worker processes. The manager only registers, starts,
//! stops and removes jobs by name and listens for exit notifications.

pub mod process;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::io::AsyncRead;
use tokio::sync::broadcast;

use crate::models::module::JobSpec;
use crate::Result;

/// Boxed future returned by scheduler calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Readable end of a job's output pipe.
pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// Identifier of one run of a job; a new one is assigned on every start.
pub type RunId = u64;

/// Output pipes of a freshly started job.
pub struct JobOutput {
    /// Run this output belongs to.
    pub run: RunId,
    /// Standard output, if the scheduler captures it.
    pub stdout: Option<OutputStream>,
    /// Error output, if the scheduler captures it.
    pub stderr: Option<OutputStream>,
}

impl JobOutput {
    /// Output handle for a run whose pipes are not captured.
    #[must_use]
    pub fn detached(run: RunId) -> Self {
        Self {
            run,
            stdout: None,
            stderr: None,
        }
    }
}

impl fmt::Debug for JobOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOutput")
            .field("run", &self.run)
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Notification that a job's process terminated, for any reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobExit {
    /// Job whose process ended.
    pub name: String,
    /// Run that ended.
    pub run: RunId,
    /// Exit code, `None` when killed by a signal or unknown.
    pub code: Option<i32>,
}

/// Runs named jobs on behalf of the module manager.
///
/// Every process termination yields exactly one [`JobExit`] on the
/// [`subscribe`](Self::subscribe) stream, whether the job crashed or was
/// stopped.
pub trait JobScheduler: Send + Sync {
    /// Register a job without starting it.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Scheduler`](crate::AppError::Scheduler) if a job
    /// with the same name is already registered.
    fn add(&self, spec: JobSpec) -> BoxFuture<'_, Result<()>>;

    /// Start a registered job and hand back its output pipes.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Scheduler`](crate::AppError::Scheduler) if the job
    /// is unknown, already running, or fails to launch.
    fn start<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<JobOutput>>;

    /// Stop a job's process if it is running. Stopping an idle job is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Scheduler`](crate::AppError::Scheduler) if the job
    /// is unknown or could not be stopped.
    fn stop<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Unregister a job, stopping it first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Scheduler`](crate::AppError::Scheduler) if the job
    /// is unknown.
    fn remove<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Subscribe to process exit notifications.
    fn subscribe(&self) -> broadcast::Receiver<JobExit>;
}

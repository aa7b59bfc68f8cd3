//! Module lifecycle management: start, stop, crash restart.
//!
//! The [`ModuleManager`] owns the mapping from module name to the jobs it
//! currently has registered with the [`JobScheduler`], together with a
//! [`JobState`] per job. Exit notifications are matched against that state:
//! a job that exits while `Starting` or `Running` crashed and is restarted
//! after a delay; a job claimed by [`ModuleManager::stop_module`] is in
//! `StoppingIntentionally` and its exit is ignored.
//!
//! Lifecycle calls for one module are serialized by a per-module lock.
//! Different modules may be started concurrently.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{EnvMap, EnvPrecedence, LauncherConfig, ModsSet};
use crate::manifest;
use crate::models::module::{module_of, JobSpec, JobState, ModuleDescriptor, MODULES};
use crate::orchestrator::job_log;
use crate::resolver::{resolve_blocking, PackageResolver};
use crate::scheduler::{JobExit, JobOutput, JobScheduler, RunId};
use crate::{AppError, Result};

/// Merge a module group's environment with the launcher's own.
///
/// With [`EnvPrecedence::Process`] the process environment wins on key
/// collisions; with [`EnvPrecedence::Module`] the module's values win.
#[must_use]
pub fn merge_environment(module: &EnvMap, process: &EnvMap, precedence: EnvPrecedence) -> EnvMap {
    let (base, overlay) = match precedence {
        EnvPrecedence::Process => (module, process),
        EnvPrecedence::Module => (process, module),
    };
    let mut env = base.clone();
    env.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Snapshot of the launcher's environment, skipping non-UTF-8 entries.
fn process_environment() -> EnvMap {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

#[derive(Debug)]
struct JobRecord {
    state: JobState,
    /// Run the scheduler reported for the current start; `None` until
    /// `start` returns.
    run: Option<RunId>,
    /// Exits seen before `run` was known.
    early_exits: Vec<RunId>,
    restart: Option<CancellationToken>,
}

impl JobRecord {
    fn starting() -> Self {
        Self {
            state: JobState::Starting,
            run: None,
            early_exits: Vec::new(),
            restart: None,
        }
    }

    fn transition(&mut self, job: &str, next: JobState) {
        if !self.state.can_transition_to(next) {
            warn!(job, from = ?self.state, to = ?next, "unexpected job state transition");
        }
        self.state = next;
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    /// Tracked job names per module, in start order.
    modules: HashMap<&'static str, Vec<String>>,
    jobs: HashMap<String, JobRecord>,
    /// Jobs no longer tracked that may still be registered with the
    /// scheduler because their `stop` or `remove` failed.
    unreconciled: HashMap<&'static str, Vec<String>>,
}

impl ManagerState {
    fn is_tracked(&self, module: &str, job: &str) -> bool {
        self.modules
            .get(module)
            .is_some_and(|jobs| jobs.iter().any(|j| j == job))
    }
}

struct Inner {
    config: LauncherConfig,
    mods: Mutex<ModsSet>,
    scheduler: Arc<dyn JobScheduler>,
    resolver: Arc<dyn PackageResolver>,
    process_env: EnvMap,
    state: Mutex<ManagerState>,
    lifecycle: HashMap<&'static str, Mutex<()>>,
}

impl Inner {
    fn lifecycle_lock(&self, module: &str) -> Result<&Mutex<()>> {
        self.lifecycle
            .get(module)
            .ok_or_else(|| AppError::UnknownModule(module.to_owned()))
    }

    fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.config.launcher.restart_delay_ms)
    }

    fn log_dir(&self) -> &Path {
        &self.config.launcher.log_dir
    }
}

/// Cloneable handle to the module manager.
#[derive(Clone)]
pub struct ModuleManager {
    inner: Arc<Inner>,
}

impl ModuleManager {
    /// Construct a manager that passes the launcher's current process
    /// environment to its jobs.
    #[must_use]
    pub fn new(
        config: LauncherConfig,
        scheduler: Arc<dyn JobScheduler>,
        resolver: Arc<dyn PackageResolver>,
    ) -> Self {
        Self::with_process_env(config, scheduler, resolver, process_environment())
    }

    /// Construct a manager with an explicit process environment.
    #[must_use]
    pub fn with_process_env(
        mut config: LauncherConfig,
        scheduler: Arc<dyn JobScheduler>,
        resolver: Arc<dyn PackageResolver>,
        process_env: EnvMap,
    ) -> Self {
        let mods = std::mem::take(&mut config.mods);
        let lifecycle = MODULES.iter().map(|d| (d.name, Mutex::new(()))).collect();
        Self {
            inner: Arc::new(Inner {
                config,
                mods: Mutex::new(mods),
                scheduler,
                resolver,
                process_env,
                state: Mutex::new(ManagerState::default()),
                lifecycle,
            }),
        }
    }

    /// Start every instance of module `name`, stopping any previous ones first.
    ///
    /// Returns once each job has been registered, started and attached to
    /// its log file; it does not wait for the jobs to become ready.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownModule` for an unknown name,
    /// `AppError::Resolve` if the entry point cannot be resolved,
    /// `AppError::Scheduler` if a scheduler call fails, or `AppError::Io` if
    /// a log file cannot be opened.
    pub async fn start_module(&self, name: &str) -> Result<()> {
        let descriptor = ModuleDescriptor::lookup(name)
            .ok_or_else(|| AppError::UnknownModule(name.to_owned()))?;

        self.start_locked(descriptor)
            .instrument(info_span!("start_module", module = name))
            .await
    }

    /// Stop and unregister every tracked job of module `name`.
    ///
    /// No-op when nothing is tracked.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownModule` for an unknown name, or the first
    /// `AppError::Scheduler` raised by a `stop` or `remove` call.
    pub async fn stop_module(&self, name: &str) -> Result<()> {
        let descriptor = ModuleDescriptor::lookup(name)
            .ok_or_else(|| AppError::UnknownModule(name.to_owned()))?;

        self.stop_locked(descriptor)
            .instrument(info_span!("stop_module", module = name))
            .await
    }

    /// Stop every module, continuing past failures.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered after all modules were attempted.
    pub async fn stop_all(&self) -> Result<()> {
        let mut first_err = None;
        for descriptor in MODULES {
            if let Err(err) = self.stop_module(descriptor.name).await {
                warn!(module = descriptor.name, %err, "failed to stop module");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Add `id` to the mods set. Returns `false` if it was already enabled.
    pub async fn enable_mod(&self, id: &str) -> bool {
        let added = self.inner.mods.lock().await.insert(id);
        if added {
            debug!(id, "mod enabled");
        }
        added
    }

    /// Remove `id` from the mods set. Returns `false` if it was not enabled.
    pub async fn disable_mod(&self, id: &str) -> bool {
        let removed = self.inner.mods.lock().await.remove(id);
        if removed {
            debug!(id, "mod disabled");
        }
        removed
    }

    /// Current mods set, in insertion order.
    pub async fn mods(&self) -> Vec<String> {
        self.inner
            .mods
            .lock()
            .await
            .iter()
            .map(str::to_owned)
            .collect()
    }

    /// Build the manifest from the current mods set and write it to the
    /// configured manifest path, replacing any previous file.
    ///
    /// Must run before any module starts; modules read it at startup.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Resolve` if any mod or bot cannot be resolved (no
    /// file is written), `AppError::Io` if the local mods directory is
    /// unusable, or `AppError::Manifest` if writing fails.
    pub async fn write_mods(&self) -> Result<()> {
        let mods = self.inner.mods.lock().await.clone();
        let config = &self.inner.config;
        let local_mods = config.local_mods_dir();
        let built = manifest::build_manifest(
            &mods,
            &config.bots,
            local_mods.as_deref(),
            &self.inner.resolver,
        )
        .await?;

        let path = &config.launcher.manifest_path;
        manifest::write_manifest(path, &built).await?;
        info!(
            mods = built.mods.len(),
            bots = built.bots.len(),
            path = %path.display(),
            "manifest written"
        );
        Ok(())
    }

    /// Job names currently tracked for `module`, in start order.
    pub async fn tracked_jobs(&self, module: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .await
            .modules
            .get(module)
            .cloned()
            .unwrap_or_default()
    }

    /// Lifecycle state of `job`, if the manager knows it.
    pub async fn job_state(&self, job: &str) -> Option<JobState> {
        self.inner.state.lock().await.jobs.get(job).map(|r| r.state)
    }

    /// Subscribe to the scheduler's exit stream and handle every exit until
    /// `cancel` fires or the stream closes.
    ///
    /// The subscription is taken before this returns, so exits of jobs
    /// started afterwards are never missed.
    #[must_use]
    pub fn spawn_exit_listener(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut exits = self.inner.scheduler.subscribe();
        let manager = self.clone();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("exit listener shutting down");
                            break;
                        }
                        event = exits.recv() => match event {
                            Ok(exit) => manager.handle_exit(&exit).await,
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "exit listener lagged behind scheduler");
                            }
                            Err(RecvError::Closed) => {
                                info!("scheduler exit stream closed");
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("exit_listener")),
        )
    }

    /// React to a job's process exit.
    ///
    /// An exit of the job's current run while it is `Starting` or `Running`
    /// and still tracked by its module is a crash: the job moves to
    /// `Exited` and a restart is scheduled. Everything else is expected and
    /// ignored.
    pub async fn handle_exit(&self, exit: &JobExit) {
        let job = exit.name.as_str();
        let module = module_of(job);
        let mut state = self.inner.state.lock().await;
        let tracked = state.is_tracked(module, job);

        let Some(record) = state.jobs.get_mut(job) else {
            debug!(job, run = exit.run, "exit of untracked job ignored");
            return;
        };

        match record.run {
            None if record.state.is_live() => {
                record.early_exits.push(exit.run);
            }
            Some(run) if run == exit.run && record.state.is_live() && tracked => {
                warn!(job, run, code = ?exit.code, "job exited unexpectedly");
                record.transition(job, JobState::Exited);
                self.schedule_restart(module, job, record);
            }
            _ => {
                debug!(job, run = exit.run, state = ?record.state, "expected job exit");
            }
        }
    }

    async fn start_locked(&self, descriptor: &'static ModuleDescriptor) -> Result<()> {
        let _lifecycle = self.inner.lifecycle_lock(descriptor.name)?.lock().await;
        self.stop_jobs(descriptor).await?;

        let count = descriptor.instance_count(self.inner.config.processors);
        info!(count, "starting module");

        let entry_point = resolve_blocking(&self.inner.resolver, descriptor.entry_point).await?;
        let environment = merge_environment(
            &self.inner.config.env_group(descriptor.env_group),
            &self.inner.process_env,
            self.inner.config.launcher.env_precedence,
        );

        for index in 0..count {
            let spec = JobSpec {
                name: descriptor.job_name(index),
                entry_point: entry_point.clone(),
                environment: environment.clone(),
            };
            self.launch(descriptor, spec).await?;
        }
        Ok(())
    }

    async fn stop_locked(&self, descriptor: &'static ModuleDescriptor) -> Result<()> {
        let _lifecycle = self.inner.lifecycle_lock(descriptor.name)?.lock().await;
        self.stop_jobs(descriptor).await
    }

    /// Register, start and log one job, then track it.
    async fn launch(&self, descriptor: &'static ModuleDescriptor, spec: JobSpec) -> Result<()> {
        let job = spec.name.clone();
        debug!(job, entry_point = %spec.entry_point.display(), "registering job");

        self.inner.scheduler.add(spec).await?;
        {
            let mut state = self.inner.state.lock().await;
            state
                .modules
                .entry(descriptor.name)
                .or_default()
                .push(job.clone());
            state.jobs.insert(job.clone(), JobRecord::starting());
        }

        let output = self.inner.scheduler.start(&job).await?;
        self.attach_and_confirm(descriptor.name, &job, output).await
    }

    async fn attach_and_confirm(&self, module: &str, job: &str, output: JobOutput) -> Result<()> {
        let run = output.run;
        job_log::attach(self.inner.log_dir(), job, output).await?;

        let mut state = self.inner.state.lock().await;
        let Some(record) = state.jobs.get_mut(job) else {
            return Ok(());
        };
        record.run = Some(run);
        let crashed = std::mem::take(&mut record.early_exits).contains(&run);
        if crashed {
            warn!(job, run, "job exited before start completed");
            record.transition(job, JobState::Exited);
            self.schedule_restart(module, job, record);
        } else if record.state == JobState::Starting {
            record.transition(job, JobState::Running);
            info!(job, run, "job started");
        }
        Ok(())
    }

    /// Claim all tracked jobs of a module and stop them.
    ///
    /// The tracked list is cleared and every job marked
    /// `StoppingIntentionally` before any scheduler call, so their exits are
    /// never taken for crashes. Jobs left behind by an earlier failed stop
    /// are retried. `remove` is attempted even when `stop` fails; a job
    /// whose `remove` fails is kept for the next lifecycle call. Caller
    /// holds the module's lifecycle lock.
    async fn stop_jobs(&self, descriptor: &'static ModuleDescriptor) -> Result<()> {
        let jobs = {
            let mut state = self.inner.state.lock().await;
            let mut jobs = state
                .modules
                .get_mut(descriptor.name)
                .map(std::mem::take)
                .unwrap_or_default();
            for job in &jobs {
                if let Some(record) = state.jobs.get_mut(job) {
                    record.transition(job, JobState::StoppingIntentionally);
                    if let Some(restart) = record.restart.take() {
                        restart.cancel();
                    }
                }
            }
            if let Some(leftovers) = state.unreconciled.remove(descriptor.name) {
                debug!(count = leftovers.len(), "retrying jobs left registered");
                jobs.extend(leftovers);
            }
            jobs
        };

        if jobs.is_empty() {
            return Ok(());
        }
        info!(count = jobs.len(), "stopping module");

        let scheduler = &self.inner.scheduler;
        let outcomes = join_all(jobs.iter().map(|job| async move {
            let stopped = scheduler.stop(job).await;
            let removed = scheduler.remove(job).await;
            (removed.is_ok(), stopped.and(removed))
        }))
        .await;

        let mut state = self.inner.state.lock().await;
        let mut first_err = None;
        for (job, (removed, result)) in jobs.into_iter().zip(outcomes) {
            state.jobs.remove(&job);
            if let Err(err) = result {
                warn!(job = %job, %err, "failed to stop job");
                first_err.get_or_insert(err);
            }
            if !removed {
                state
                    .unreconciled
                    .entry(descriptor.name)
                    .or_default()
                    .push(job);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Arm a cancellable restart of a crashed job.
    fn schedule_restart(&self, module: &str, job: &str, record: &mut JobRecord) {
        let Some(descriptor) = ModuleDescriptor::lookup(module) else {
            warn!(job, module, "crashed job belongs to no known module");
            return;
        };
        let token = CancellationToken::new();
        if let Some(previous) = record.restart.replace(token.clone()) {
            previous.cancel();
        }

        let delay = self.inner.restart_delay();
        let manager = self.clone();
        let job = job.to_owned();
        let span = info_span!("restart_job", job = %job);
        info!(job, delay_ms = self.inner.config.launcher.restart_delay_ms, "restart scheduled");

        tokio::spawn(
            async move {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!("pending restart cancelled");
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                if let Err(err) = manager.restart_job(descriptor, &job, &token).await {
                    warn!(%err, "restart failed");
                }
            }
            .instrument(span),
        );
    }

    async fn restart_job(
        &self,
        descriptor: &'static ModuleDescriptor,
        job: &str,
        token: &CancellationToken,
    ) -> Result<()> {
        let _lifecycle = self.inner.lifecycle_lock(descriptor.name)?.lock().await;
        if token.is_cancelled() {
            return Ok(());
        }

        {
            let mut state = self.inner.state.lock().await;
            let tracked = state.is_tracked(descriptor.name, job);
            let Some(record) = state.jobs.get_mut(job) else {
                return Ok(());
            };
            if !tracked || record.state != JobState::Exited {
                debug!(state = ?record.state, "job no longer needs a restart");
                return Ok(());
            }
            record.restart = None;

            if !self.inner.config.launcher.restart_on_crash {
                info!("restart disabled, job left exited");
                return Ok(());
            }
            record.transition(job, JobState::Starting);
            record.run = None;
            record.early_exits.clear();
        }

        info!("restarting job");
        match self.inner.scheduler.start(job).await {
            Ok(output) => self.attach_and_confirm(descriptor.name, job, output).await,
            Err(err) => {
                if let Some(record) = self.inner.state.lock().await.jobs.get_mut(job) {
                    record.transition(job, JobState::Exited);
                }
                Err(err)
            }
        }
    }
}

//! Module descriptors, job specifications, and the job lifecycle.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Separator between a module name and an elastic instance index.
pub const INSTANCE_DELIMITER: char = '_';

/// Static description of a known module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// Module name used in configuration and job names.
    pub name: &'static str,
    /// Configuration environment group the module's jobs receive.
    pub env_group: &'static str,
    /// Package-relative reference to the module's entry script.
    pub entry_point: &'static str,
    /// Whether the instance count follows the configured processor count.
    pub elastic: bool,
}

/// All modules the launcher knows how to run, in start order.
pub const MODULES: &[ModuleDescriptor] = &[
    ModuleDescriptor {
        name: "backend",
        env_group: "backend",
        entry_point: "@screeps/backend/bin/start",
        elastic: false,
    },
    ModuleDescriptor {
        name: "main",
        env_group: "engine",
        entry_point: "@screeps/engine/dist/main",
        elastic: false,
    },
    ModuleDescriptor {
        name: "processor",
        env_group: "engine",
        entry_point: "@screeps/engine/dist/processor",
        elastic: true,
    },
    ModuleDescriptor {
        name: "runner",
        env_group: "engine",
        entry_point: "@screeps/engine/dist/runner",
        elastic: false,
    },
    ModuleDescriptor {
        name: "storage",
        env_group: "storage",
        entry_point: "@screeps/storage/bin/start",
        elastic: false,
    },
];

impl ModuleDescriptor {
    /// Find the descriptor for `name`.
    #[must_use]
    pub fn lookup(name: &str) -> Option<&'static Self> {
        MODULES.iter().find(|d| d.name == name)
    }

    /// Number of jobs this module runs given the configured processor count.
    #[must_use]
    pub fn instance_count(&self, processors: usize) -> usize {
        if self.elastic {
            processors
        } else {
            1
        }
    }

    /// Job name for instance `index`.
    #[must_use]
    pub fn job_name(&self, index: usize) -> String {
        if self.elastic {
            format!("{}{INSTANCE_DELIMITER}{index}", self.name)
        } else {
            self.name.to_owned()
        }
    }
}

/// Module that owns `job_name`: everything before the first delimiter.
#[must_use]
pub fn module_of(job_name: &str) -> &str {
    job_name
        .split_once(INSTANCE_DELIMITER)
        .map_or(job_name, |(module, _)| module)
}

/// Everything the scheduler needs to register one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Unique job name.
    pub name: String,
    /// Absolute path to the entry script.
    pub entry_point: PathBuf,
    /// Complete worker environment.
    pub environment: BTreeMap<String, String>,
}

/// Lifecycle of a job tracked by the module manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Registered with the scheduler, start not yet confirmed.
    Starting,
    /// Scheduler confirmed the start.
    Running,
    /// `stop_module` claimed the job; its exit is expected.
    StoppingIntentionally,
    /// Process ended without being asked to.
    Exited,
}

impl JobState {
    /// Whether an exit in this state is unexpected.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting | Self::Exited, Self::Running)
                | (
                    Self::Starting | Self::Running,
                    Self::Exited | Self::StoppingIntentionally
                )
                | (Self::Exited, Self::StoppingIntentionally | Self::Starting)
        )
    }
}

//! Launcher configuration parsing, normalization, and validation.

use std::collections::BTreeMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::models::module::{ModuleDescriptor, MODULES};
use crate::{AppError, Result};

/// File name looked up in the working directory by [`LauncherConfig::load`].
pub const CONFIG_FILE: &str = "config.toml";

/// Key file picked up automatically when present in the working directory.
pub const STEAM_KEY_FILE: &str = "STEAM_KEY";

/// Environment variable map for one module group.
pub type EnvMap = BTreeMap<String, String>;

/// Which side wins when a module-group variable and a variable inherited
/// from the launcher's own process share a key.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvPrecedence {
    /// The launcher's process environment overrides module configuration.
    #[default]
    Process,
    /// Module configuration overrides the launcher's process environment.
    Module,
}

/// Ordered set of mod package identifiers.
///
/// Duplicates are dropped on load; insertion order is otherwise kept so the
/// manifest lists mods in the order they were configured.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(from = "Vec<String>")]
pub struct ModsSet(Vec<String>);

impl ModsSet {
    /// Add `id` if absent. Returns `true` when the set changed.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.contains(id) {
            return false;
        }
        self.0.push(id.to_owned());
        true
    }

    /// Remove `id` if present. Returns `true` when the set changed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|m| m != id);
        before != self.0.len()
    }

    /// Whether `id` is a member.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|m| m == id)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate members in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for ModsSet {
    fn from(ids: Vec<String>) -> Self {
        let mut set = Self::default();
        for id in &ids {
            set.insert(id);
        }
        set
    }
}

/// Settings for the launcher itself rather than the launched modules.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LauncherSettings {
    /// Directory receiving one `<job>.log` per job.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Manifest written by the manifest builder.
    #[serde(default = "default_manifest_path")]
    pub manifest_path: PathBuf,
    /// Directory containing `node_modules`.
    #[serde(default = "default_package_root")]
    pub package_root: PathBuf,
    /// Interpreter used to run module entry points.
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Delay before a crashed job is restarted.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Restart crashed jobs; when `false` crashes are only logged.
    #[serde(default = "default_true")]
    pub restart_on_crash: bool,
    /// Environment merge precedence for launched jobs.
    #[serde(default)]
    pub env_precedence: EnvPrecedence,
    /// Unix socket path (or `\\.\pipe\...` name on Windows) on which
    /// workers may ask the launcher to shut down. Empty disables it.
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,
}

impl LauncherSettings {
    /// Control socket path, or `None` when the control channel is disabled.
    #[must_use]
    pub fn control_socket(&self) -> Option<&Path> {
        if self.control_socket.as_os_str().is_empty() {
            None
        } else {
            Some(&self.control_socket)
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from("mods.json")
}

fn default_package_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_runtime() -> String {
    "node".into()
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("launcher.sock")
}

fn default_true() -> bool {
    true
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            manifest_path: default_manifest_path(),
            package_root: default_package_root(),
            runtime: default_runtime(),
            restart_delay_ms: default_restart_delay_ms(),
            restart_on_crash: true,
            env_precedence: EnvPrecedence::default(),
            control_socket: default_control_socket(),
        }
    }
}

/// Launcher configuration parsed from `config.toml`.
///
/// Every field is optional; an empty file yields a configuration that runs
/// all five modules with stock ports.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct LauncherConfig {
    /// Instance count of the elastic `processor` module.
    pub processors: usize,
    /// Thread count exported to the engine as `RUNNER_THREADS`.
    pub runner_threads: usize,
    /// Environment variables per module group (`shared`, `backend`, ...).
    pub env: BTreeMap<String, EnvMap>,
    /// Mod packages to load.
    pub mods: ModsSet,
    /// Bots by name; values are package identifiers or `./relative` paths.
    pub bots: BTreeMap<String, String>,
    /// Directory scanned for loose mod scripts; empty disables the scan.
    pub local_mods: String,
    /// Module enable flags; modules missing here are enabled.
    pub modules: BTreeMap<String, bool>,
    /// Steam Web API key exported to the backend.
    pub steam_key: String,
    /// File holding the Steam Web API key.
    pub steam_key_file: String,
    /// Launcher-level settings.
    pub launcher: LauncherSettings,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self {
            processors: cores,
            runner_threads: cores.saturating_sub(1).max(1),
            env: BTreeMap::new(),
            mods: ModsSet::default(),
            bots: BTreeMap::new(),
            local_mods: "mods".into(),
            modules: BTreeMap::new(),
            steam_key: String::new(),
            steam_key_file: String::new(),
            launcher: LauncherSettings::default(),
        }
    }
}

/// Stock environment for each module group, layered under user values.
fn default_env() -> BTreeMap<String, EnvMap> {
    let group = |pairs: &[(&str, &str)]| -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    };
    BTreeMap::from([
        (
            "shared".to_owned(),
            group(&[
                ("MODFILE", "mods.json"),
                ("STORAGE_HOST", "127.0.0.1"),
                ("STORAGE_PORT", "21027"),
            ]),
        ),
        (
            "backend".to_owned(),
            group(&[
                ("GAME_HOST", "0.0.0.0"),
                ("GAME_PORT", "21025"),
                ("CLI_HOST", "127.0.0.1"),
                ("CLI_PORT", "21026"),
                ("ASSET_DIR", "assets"),
            ]),
        ),
        (
            "engine".to_owned(),
            group(&[("DRIVER_MODULE", "@screeps/driver")]),
        ),
        ("storage".to_owned(), group(&[("DB_PATH", "db.json")])),
    ])
}

impl LauncherConfig {
    /// Load `config.toml` from `dir` (defaults when absent), then normalize.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, fails validation, or names an unreadable key file.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let path = dir.join(CONFIG_FILE);
        let mut config = if path.is_file() {
            let raw = fs::read_to_string(&path)
                .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
            let config = Self::from_toml_str(&raw)?;
            info!(path = %path.display(), "loaded config");
            config
        } else {
            warn!(path = %path.display(), "no config file found, using defaults");
            Self::default()
        };
        config.sync(dir)?;
        Ok(config)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Fill in derived environment values.
    ///
    /// Layers the stock environment under the configured one, pins
    /// `MODFILE` to the manifest path, folds `shared` into every module
    /// group (group values win), exports `RUNNER_THREADS` to the engine,
    /// and picks up the Steam key from `dir`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the configured key file cannot be read.
    pub fn sync(&mut self, dir: &Path) -> Result<()> {
        for (group, defaults) in default_env() {
            let vars = self.env.entry(group).or_default();
            for (key, value) in defaults {
                vars.entry(key).or_insert(value);
            }
        }

        let modfile = self.launcher.manifest_path.to_string_lossy().into_owned();
        let shared = self.env.entry("shared".to_owned()).or_default();
        shared.insert("MODFILE".to_owned(), modfile);
        let shared = shared.clone();

        for descriptor in MODULES {
            let vars = self.env.entry(descriptor.env_group.to_owned()).or_default();
            for (key, value) in &shared {
                vars.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        if self.runner_threads > 0 {
            self.env
                .entry("engine".to_owned())
                .or_default()
                .insert("RUNNER_THREADS".to_owned(), self.runner_threads.to_string());
        }

        if dir.join(STEAM_KEY_FILE).is_file() {
            self.steam_key_file = STEAM_KEY_FILE.to_owned();
        }
        if !self.steam_key_file.is_empty() {
            let key_path = dir.join(&self.steam_key_file);
            let key = fs::read_to_string(&key_path).map_err(|err| {
                AppError::Config(format!(
                    "failed to read steam key file {}: {err}",
                    key_path.display()
                ))
            })?;
            self.steam_key = key.trim().to_owned();
        }
        if !self.steam_key.is_empty() {
            self.env
                .entry("backend".to_owned())
                .or_default()
                .insert("STEAM_KEY".to_owned(), self.steam_key.clone());
        }

        Ok(())
    }

    /// Whether `module` should be started by the driver.
    #[must_use]
    pub fn is_module_enabled(&self, module: &str) -> bool {
        self.modules.get(module).copied().unwrap_or(true)
    }

    /// Descriptors of the modules the driver should start, in table order.
    pub fn enabled_modules(&self) -> impl Iterator<Item = &'static ModuleDescriptor> + '_ {
        MODULES.iter().filter(|d| self.is_module_enabled(d.name))
    }

    /// Configured environment for a module group; empty when unset.
    #[must_use]
    pub fn env_group(&self, group: &str) -> EnvMap {
        self.env.get(group).cloned().unwrap_or_default()
    }

    /// Local mods directory, or `None` when the scan is disabled.
    #[must_use]
    pub fn local_mods_dir(&self) -> Option<PathBuf> {
        if self.local_mods.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.local_mods))
        }
    }

    fn validate(&self) -> Result<()> {
        if self.processors == 0 {
            return Err(AppError::Config(
                "processors must be greater than zero".into(),
            ));
        }

        if let Some(unknown) = self
            .modules
            .keys()
            .find(|name| ModuleDescriptor::lookup(name).is_none())
        {
            return Err(AppError::Config(format!(
                "modules.{unknown} is not a known module"
            )));
        }

        Ok(())
    }
}

//! Package identifier resolution.
//!
//! Maps npm-style identifiers (`screepsmod-auth`, `@screeps/engine/dist/main`)
//! to absolute entry-script paths under a `node_modules` tree.

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::{AppError, Result};

/// Resolves a package identifier to the absolute path of its entry script.
pub trait PackageResolver: Send + Sync {
    /// Resolve `id` to an absolute script path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Resolve` if `id` cannot be resolved.
    fn resolve(&self, id: &str) -> Result<PathBuf>;
}

/// Run `resolver` for `id` on the blocking pool.
///
/// Resolution reads `package.json` files and checks the file system, so it
/// is kept off the async worker threads.
///
/// # Errors
///
/// Returns the resolver's error, or `AppError::Resolve` if the blocking
/// task itself fails.
pub async fn resolve_blocking(resolver: &Arc<dyn PackageResolver>, id: &str) -> Result<PathBuf> {
    let resolver = Arc::clone(resolver);
    let owned = id.to_owned();
    tokio::task::spawn_blocking(move || resolver.resolve(&owned))
        .await
        .map_err(|err| AppError::Resolve(format!("resolver task for {id} failed: {err}")))?
}

#[derive(Debug, Deserialize)]
struct PackageJson {
    main: Option<String>,
}

/// Resolver backed by `<root>/node_modules`.
///
/// A bare package identifier resolves through the `main` field of its
/// `package.json` (`index.js` when absent). An identifier with a subpath
/// resolves to that file, trying the `.js` extension and `index.js`.
#[derive(Debug, Clone)]
pub struct NodePackageResolver {
    modules_dir: PathBuf,
}

impl NodePackageResolver {
    /// Construct a resolver for the `node_modules` directory under `root`.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            modules_dir: root.as_ref().join("node_modules"),
        }
    }

    fn read_main(package_dir: &Path) -> Result<Option<PathBuf>> {
        let manifest = package_dir.join("package.json");
        if !manifest.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&manifest).map_err(|err| {
            AppError::Resolve(format!("failed to read {}: {err}", manifest.display()))
        })?;
        let package: PackageJson = serde_json::from_str(&raw).map_err(|err| {
            AppError::Resolve(format!("invalid {}: {err}", manifest.display()))
        })?;
        let main = package.main.unwrap_or_else(|| "index.js".into());
        Ok(Some(package_dir.join(main)))
    }
}

impl PackageResolver for NodePackageResolver {
    fn resolve(&self, id: &str) -> Result<PathBuf> {
        let relative = Path::new(id);
        if id.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(AppError::Resolve(format!(
                "invalid package identifier {id:?}"
            )));
        }

        let base = self.modules_dir.join(relative);
        let target = match Self::read_main(&base)? {
            Some(main) => script_file(&main),
            None => script_file(&base),
        };

        let script = target.ok_or_else(|| {
            AppError::Resolve(format!(
                "cannot find {id} in {}",
                self.modules_dir.display()
            ))
        })?;
        std::path::absolute(&script)
            .map_err(|err| AppError::Resolve(format!("cannot absolutize {id}: {err}")))
    }
}

/// Node-style file lookup: exact file, then `.js`, then `index.js` inside.
fn script_file(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    let mut with_ext = OsString::from(path.as_os_str());
    with_ext.push(".js");
    let with_ext = PathBuf::from(with_ext);
    if with_ext.is_file() {
        return Some(with_ext);
    }
    let index = path.join("index.js");
    index.is_file().then_some(index)
}

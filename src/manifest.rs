//! Manifest builder.
//!
//! Resolves configured mod and bot identifiers plus loose scripts found in
//! the local mods directory into a single [`Manifest`], and writes it
//! atomically via `tempfile::NamedTempFile::persist()` so launched modules
//! never observe a partial file.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::fs;
use tracing::debug;

use crate::config::ModsSet;
use crate::models::manifest::Manifest;
use crate::resolver::{resolve_blocking, PackageResolver};
use crate::{AppError, Result};

/// File extension of loose mod scripts.
pub const SCRIPT_EXTENSION: &str = "js";

/// Build the manifest contents.
///
/// - Every mod identifier is resolved; the first failure aborts the build.
/// - A bot identifier starting with `.` is kept verbatim; any other is
///   resolved and replaced by the directory holding its entry script.
/// - When `local_mods` is set the directory is created if missing and its
///   `.js` files are appended in file-name order. They are not de-duplicated
///   against resolved mods.
///
/// # Errors
///
/// Returns `AppError::Resolve` if any identifier cannot be resolved, or
/// `AppError::Io` if the local mods directory cannot be created or read.
pub async fn build_manifest(
    mods: &ModsSet,
    bots: &BTreeMap<String, String>,
    local_mods: Option<&Path>,
    resolver: &Arc<dyn PackageResolver>,
) -> Result<Manifest> {
    let mut manifest = Manifest::default();

    for id in mods.iter() {
        let script = resolve_blocking(resolver, id).await?;
        manifest.mods.push(script.to_string_lossy().into_owned());
    }

    for (name, id) in bots {
        let dir = if id.starts_with('.') {
            id.clone()
        } else {
            let script = resolve_blocking(resolver, id).await?;
            script
                .parent()
                .ok_or_else(|| {
                    AppError::Resolve(format!(
                        "bot {name}: {} has no parent directory",
                        script.display()
                    ))
                })?
                .to_string_lossy()
                .into_owned()
        };
        manifest.bots.insert(name.clone(), dir);
    }

    if let Some(dir) = local_mods {
        manifest.mods.extend(scan_local_mods(dir).await?);
    }

    Ok(manifest)
}

/// Script files directly inside `dir`, as `dir/<file>`, sorted by name.
async fn scan_local_mods(dir: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(dir).await.map_err(|err| {
        AppError::Io(format!(
            "failed to create local mods directory {}: {err}",
            dir.display()
        ))
    })?;

    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|err| AppError::Io(format!("failed to read {}: {err}", dir.display())))?;

    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| AppError::Io(format!("failed to read {}: {err}", dir.display())))?
    {
        let path = entry.path();
        let is_script = path
            .extension()
            .is_some_and(|ext| ext == SCRIPT_EXTENSION);
        let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
        if is_script && !is_dir {
            names.push(entry.file_name());
        }
    }
    names.sort();

    debug!(dir = %dir.display(), count = names.len(), "scanned local mods");
    Ok(names
        .into_iter()
        .map(|name| dir.join(name).to_string_lossy().into_owned())
        .collect())
}

/// Serialize `manifest` as pretty JSON and atomically replace `path`.
///
/// The write happens on the blocking pool.
///
/// # Errors
///
/// Returns `AppError::Manifest` on serialization, temp file, or rename
/// failure.
pub async fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    let json = serde_json::to_string_pretty(manifest)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || persist_atomically(&path, json.as_bytes()))
        .await
        .map_err(|err| AppError::Manifest(format!("manifest write task failed: {err}")))?
}

fn persist_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|err| {
        AppError::Manifest(format!(
            "failed to create directory {}: {err}",
            parent.display()
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Manifest(format!("failed to create temporary file: {err}")))?;
    tmp.write_all(contents)
        .map_err(|err| AppError::Manifest(format!("failed to write temporary file: {err}")))?;
    tmp.persist(path).map_err(|err| {
        AppError::Manifest(format!("failed to persist {}: {err}", path.display()))
    })?;

    Ok(())
}

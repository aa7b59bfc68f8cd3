//! Per-job output capture.
//!
//! Appends everything a job writes to stdout and stderr to
//! `<log_dir>/<job>.log`, byte for byte. The file stays open until both
//! pipes reach EOF, which happens when the job's process exits, and is
//! closed when the pump task ends.

use std::path::{Path, PathBuf};

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{debug, warn};

use crate::scheduler::JobOutput;
use crate::{AppError, Result};

/// Log file path for `job` inside `log_dir`.
#[must_use]
pub fn log_path(log_dir: &Path, job: &str) -> PathBuf {
    log_dir.join(format!("{job}.log"))
}

/// Open the job's log in append mode and start copying its output into it.
///
/// Creates `log_dir` if it does not exist and writes a timestamped marker
/// line so restarts of the same job are visible in the shared file.
///
/// # Errors
///
/// Returns `AppError::Io` if the directory or the log file cannot be
/// created or written.
pub async fn attach(log_dir: &Path, job: &str, output: JobOutput) -> Result<JoinHandle<()>> {
    fs::create_dir_all(log_dir).await.map_err(|err| {
        AppError::Io(format!(
            "failed to create log directory {}: {err}",
            log_dir.display()
        ))
    })?;

    let path = log_path(log_dir, job);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|err| AppError::Io(format!("failed to open {}: {err}", path.display())))?;

    let marker = format!(
        "--- {job} run {} started {} ---\n",
        output.run,
        Utc::now().to_rfc3339()
    );
    file.write_all(marker.as_bytes())
        .await
        .map_err(|err| AppError::Io(format!("failed to write {}: {err}", path.display())))?;

    Ok(tokio::spawn(pump(job.to_owned(), file, output)))
}

async fn pump(job: String, mut file: File, output: JobOutput) {
    let readers = [output.stdout, output.stderr]
        .into_iter()
        .flatten()
        .map(|reader| FramedRead::new(reader, BytesCodec::new()));
    let mut chunks = stream::select_all(readers);

    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(chunk) => {
                debug!(job, output = %String::from_utf8_lossy(&chunk).trim_end());
                if let Err(err) = file.write_all(&chunk).await {
                    warn!(job, %err, "failed to append to job log");
                }
            }
            // Pipe read errors end that pipe; the other keeps flowing.
            Err(err) => warn!(job, %err, "job output pipe failed"),
        }
    }

    if let Err(err) = file.flush().await {
        warn!(job, %err, "failed to flush job log");
    }
    debug!(job, "job log closed");
}

//! Local control socket through which workers ask the launcher to shut down.
//!
//! Listens on a Unix domain socket (Linux/macOS) or named pipe (Windows)
//! using the `interprocess` crate. Every job is told where to find it
//! through [`CONTROL_ENV`]; the interpreter bootstrap exposes
//! `screepsLauncher.terminate()` to module code, which connects and sends a
//! `terminate` request.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "terminate", "job": "main"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true}
//! {"ok": false, "error": "unknown command: reload"}
//! ```

use std::path::Path;

use interprocess::local_socket::{tokio::prelude::*, GenericFilePath, ListenerOptions, ToFsName};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{AppError, Result};

/// Environment variable holding the control socket path in every job.
pub const CONTROL_ENV: &str = "LAUNCHER_CONTROL";

/// Environment variable holding the job's own name.
pub const JOB_ENV: &str = "LAUNCHER_JOB";

#[derive(Debug, Deserialize)]
struct ControlRequest {
    command: String,
    /// Job sending the request, for logging.
    job: Option<String>,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ControlResponse {
    fn success() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// Bind the control socket at `path` and serve it until `ct` fires.
///
/// A `terminate` request cancels `terminate`; the caller decides how to
/// shut down. A leftover socket file at `path` is replaced.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_control_server(
    path: &Path,
    terminate: CancellationToken,
    ct: CancellationToken,
) -> Result<JoinHandle<()>> {
    #[cfg(unix)]
    if path.exists() {
        std::fs::remove_file(path).map_err(|err| {
            AppError::Ipc(format!(
                "cannot replace stale control socket {}: {err}",
                path.display()
            ))
        })?;
    }

    let name = path.to_fs_name::<GenericFilePath>().map_err(|err| {
        AppError::Ipc(format!("invalid control socket {}: {err}", path.display()))
    })?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create control listener: {err}")))?;

    info!(path = %path.display(), "control socket listening");
    let span = info_span!("control_server", path = %path.display());

    Ok(tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("control socket shutting down");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok(stream) => {
                            tokio::spawn(handle_connection(stream, terminate.clone()));
                        }
                        Err(err) => warn!(%err, "control accept failed"),
                    }
                }
            }
        }
        .instrument(span),
    ))
}

async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    terminate: CancellationToken,
) {
    async move {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<ControlRequest>(trimmed) {
                        Ok(request) => dispatch(&request, &terminate),
                        Err(err) => ControlResponse::error(format!("invalid json: {err}")),
                    };
                    let mut reply = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    reply.push('\n');

                    if let Err(err) = writer.write_all(reply.as_bytes()).await {
                        debug!(%err, "control client went away before the reply");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "control read error");
                    break;
                }
            }
        }
    }
    .instrument(info_span!("control_conn"))
    .await;
}

fn dispatch(request: &ControlRequest, terminate: &CancellationToken) -> ControlResponse {
    let job = request.job.as_deref().unwrap_or("unknown");
    match request.command.as_str() {
        "terminate" => {
            info!(job, "worker requested launcher shutdown");
            terminate.cancel();
            ControlResponse::success()
        }
        other => {
            warn!(job, command = other, "unknown control command");
            ControlResponse::error(format!("unknown command: {other}"))
        }
    }
}

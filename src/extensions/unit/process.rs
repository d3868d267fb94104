//! Child-process units speaking newline-delimited JSON over stdio

use super::{KillSwitch, LaunchSpec, UnitHandle, UnitLauncher};
use crate::extensions::error::RuntimeError;
use crate::extensions::protocol::{HostMessage, UnitMessage};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// Longest line accepted from a unit's stdout
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Outcome of reading one line from a unit
#[derive(Debug, PartialEq, Eq)]
enum Line {
    /// A line is in the buffer (newline stripped)
    Complete,
    /// The line exceeded the limit and was discarded; carries its length
    Oversized(usize),
    Eof,
}

/// Read up to the next newline, buffering at most `limit` bytes. The rest of
/// an oversized line is consumed and dropped without being stored.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut total = 0usize;
    let mut oversized = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (total, oversized) {
                (0, _) => Line::Eof,
                (_, true) => Line::Oversized(total),
                (_, false) => Line::Complete,
            });
        }

        let newline = available.iter().position(|b| *b == b'\n');
        let chunk = &available[..newline.unwrap_or(available.len())];
        total += chunk.len();
        if !oversized {
            if buf.len() + chunk.len() > limit {
                oversized = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        let used = chunk.len() + usize::from(newline.is_some());
        reader.consume(used);

        if newline.is_some() {
            return Ok(if oversized {
                Line::Oversized(total)
            } else {
                Line::Complete
            });
        }
    }
}

/// Launches `main` (through `runtime` when the manifest names one)
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    /// Extra environment passed to every unit
    env: Vec<(String, String)>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self, spec: &LaunchSpec) -> Command {
        let entry = spec.extension_dir.join(&spec.manifest.main);
        let mut cmd = match spec.manifest.runtime.as_deref() {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&entry);
                cmd
            }
            None => Command::new(&entry),
        };
        cmd.current_dir(&spec.extension_dir)
            .env("EXTENSION_ID", spec.extension_id())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

#[async_trait]
impl UnitLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<UnitHandle, RuntimeError> {
        let extension_id = spec.extension_id().to_string();
        let launch_error = |message: String| RuntimeError::Launch {
            extension_id: extension_id.clone(),
            message,
        };

        let mut child = self
            .command(spec)
            .spawn()
            .map_err(|e| launch_error(e.to_string()))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error("stdout not captured".into()))?;
        let stderr = child.stderr.take();

        tracing::info!(
            extension = %extension_id,
            pid = child.id().unwrap_or_default(),
            "Started extension process"
        );

        let (host_tx, mut host_rx) = mpsc::unbounded_channel::<HostMessage>();
        let (unit_tx, unit_rx) = mpsc::unbounded_channel::<UnitMessage>();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        // writer: host messages -> stdin
        let ext = extension_id.clone();
        tokio::spawn(async move {
            while let Some(message) = host_rx.recv().await {
                let mut line = match serde_json::to_string(&message) {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::error!(extension = %ext, error = %err, "Failed to encode host message");
                        continue;
                    }
                };
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
                    tracing::debug!(extension = %ext, "Unit stdin closed");
                    break;
                }
            }
        });

        // reader: stdout lines -> unit messages
        let ext = extension_id.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                match read_line_bounded(&mut reader, &mut buf, MAX_LINE_BYTES).await {
                    Ok(Line::Complete) => {
                        if buf.iter().all(u8::is_ascii_whitespace) {
                            continue;
                        }
                        match serde_json::from_slice::<UnitMessage>(&buf) {
                            Ok(message) => {
                                if unit_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(extension = %ext, error = %err, "Ignoring malformed unit message");
                            }
                        }
                    }
                    Ok(Line::Oversized(bytes)) => {
                        tracing::warn!(extension = %ext, bytes, "Dropping oversized unit message");
                    }
                    Ok(Line::Eof) => break,
                    Err(err) => {
                        tracing::warn!(extension = %ext, error = %err, "Failed to read from unit");
                        break;
                    }
                }
            }
            // dropping unit_tx tells the host the unit is gone
        });

        if let Some(stderr) = stderr {
            let ext = extension_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(extension = %ext, "[stderr] {}", line);
                }
            });
        }

        // watcher: owns the child until it exits or is killed
        let ext = extension_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => tracing::debug!(extension = %ext, %status, "Extension process exited"),
                        Err(err) => tracing::warn!(extension = %ext, error = %err, "Failed to wait for extension process"),
                    }
                }
                _ = kill_rx => {
                    if let Err(err) = child.kill().await {
                        tracing::warn!(extension = %ext, error = %err, "Failed to kill extension process");
                    } else {
                        tracing::info!(extension = %ext, "Killed extension process");
                    }
                }
            }
        });

        Ok(UnitHandle {
            sender: host_tx,
            receiver: unit_rx,
            kill: KillSwitch::Process(kill_tx),
        })
    }
}

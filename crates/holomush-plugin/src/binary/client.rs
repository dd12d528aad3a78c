//! RPC clients for binary plugins.
//!
//! [`ClientFactory`] is the pluggable seam between the binary host and the
//! transport: production uses [`SubprocessFactory`], which spawns the plugin
//! executable and speaks newline-delimited JSON frames over its stdio;
//! tests inject fakes.
//!
//! The subprocess client keeps a map of pending requests completed by a
//! background read task, so calls may be issued concurrently over the one
//! pipe. The same read task answers host-call frames through the shared
//! [`HostFunctions`] surface.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use holomush_core::{EmitEvent, Event};
use holomush_plugin_sdk::wire::{
    HostFrame, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PROTOCOL_VERSION, PluginFrame, decode_emit,
    encode_event,
};

use crate::hostfn::HostFunctions;
use crate::manifest::Manifest;

/// How long the child gets to answer the opening handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport-level failures from a plugin client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Spawning or talking to the child failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The versioned handshake did not complete.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The plugin reported a handler error.
    #[error("plugin error: {0}")]
    Remote(String),

    /// The child went away mid-call.
    #[error("plugin process disconnected")]
    Disconnected,
}

/// A connected binary plugin, ready to handle events.
#[async_trait]
pub trait PluginClient: Send + Sync {
    /// Delivers one event and returns the emits from the response.
    async fn handle_event(&self, event: &Event) -> Result<Vec<EmitEvent>, ClientError>;

    /// Kills the plugin process. Idempotent.
    async fn shutdown(&self);
}

/// Builds connected clients. The production factory spawns subprocesses;
/// tests provide fakes.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Spawns and handshakes a client for `manifest` using the resolved
    /// `executable`. On error no live child remains.
    async fn connect(
        &self,
        manifest: &Manifest,
        executable: &Path,
        host_fns: Arc<HostFunctions>,
    ) -> Result<Arc<dyn PluginClient>, ClientError>;
}

// ============================================================================
// Subprocess transport
// ============================================================================

/// Spawns plugin executables and connects over stdio.
#[derive(Debug, Default)]
pub struct SubprocessFactory;

#[async_trait]
impl ClientFactory for SubprocessFactory {
    async fn connect(
        &self,
        manifest: &Manifest,
        executable: &Path,
        host_fns: Arc<HostFunctions>,
    ) -> Result<Arc<dyn PluginClient>, ClientError> {
        let mut command = Command::new(executable);
        command.kill_on_drop(true);
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        if let Some(dir) = executable.parent() {
            command.current_dir(dir);
        }
        command.env("HOLOMUSH_PLUGIN_NAME", &manifest.name);

        let mut child = command
            .spawn()
            .map_err(|e| ClientError::Transport(format!("failed to spawn plugin: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Transport("plugin stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Transport("plugin stdout unavailable".into()))?;
        let stderr = child.stderr.take();

        let client = Arc::new(SubprocessClient {
            plugin: manifest.name.clone(),
            writer: Mutex::new(stdin),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            child: Mutex::new(Some(child)),
        });

        let mut reader = BufReader::new(stdout).lines();
        match client.handshake(&mut reader).await {
            Ok(version) => {
                debug!(plugin = %client.plugin, version, "plugin handshake complete");
            }
            Err(e) => {
                client.shutdown().await;
                return Err(e);
            }
        }

        client.spawn_stdout_task(reader, host_fns);
        if let Some(stderr) = stderr {
            client.spawn_stderr_task(stderr);
        }
        Ok(client)
    }
}

struct SubprocessClient {
    plugin: String,
    writer: Mutex<tokio::process::ChildStdin>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Vec<EmitEvent>, ClientError>>>>,
    next_request_id: AtomicU64,
    child: Mutex<Option<Child>>,
}

impl SubprocessClient {
    async fn write_frame(&self, frame: &HostFrame) -> Result<(), ClientError> {
        let line = serde_json::to_string(frame)
            .map_err(|e| ClientError::Transport(format!("failed to encode frame: {e}")))?;
        let mut writer = self.writer.lock().await;
        let io = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        io.await
            .map_err(|e| ClientError::Transport(format!("failed to write frame: {e}")))
    }

    async fn handshake(
        &self,
        reader: &mut tokio::io::Lines<BufReader<ChildStdout>>,
    ) -> Result<u32, ClientError> {
        self.write_frame(&HostFrame::Handshake {
            magic_key: MAGIC_COOKIE_KEY.to_string(),
            magic_value: MAGIC_COOKIE_VALUE.to_string(),
            protocol_version: PROTOCOL_VERSION,
        })
        .await?;

        let line = tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next_line())
            .await
            .map_err(|_| ClientError::Handshake("timed out awaiting handshake".into()))?
            .map_err(|e| ClientError::Handshake(format!("failed to read handshake: {e}")))?
            .ok_or_else(|| ClientError::Handshake("plugin closed stdout before handshake".into()))?;

        match serde_json::from_str::<PluginFrame>(&line) {
            Ok(PluginFrame::Handshake { protocol_version }) => {
                if protocol_version == PROTOCOL_VERSION {
                    Ok(protocol_version)
                } else {
                    Err(ClientError::Handshake(format!(
                        "protocol version mismatch: plugin {protocol_version}, host {PROTOCOL_VERSION}"
                    )))
                }
            }
            Ok(other) => Err(ClientError::Handshake(format!(
                "expected handshake, got {other:?}"
            ))),
            Err(e) => Err(ClientError::Handshake(format!(
                "malformed handshake frame: {e}"
            ))),
        }
    }

    fn spawn_stdout_task(
        self: &Arc<Self>,
        mut reader: tokio::io::Lines<BufReader<ChildStdout>>,
        host_fns: Arc<HostFunctions>,
    ) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(Some(line)) = reader.next_line().await {
                match serde_json::from_str::<PluginFrame>(&line) {
                    Ok(PluginFrame::Response {
                        id,
                        emit_events,
                        error,
                    }) => {
                        let sender = client.pending.lock().await.remove(&id);
                        let Some(sender) = sender else {
                            warn!(plugin = %client.plugin, id, "response for unknown request");
                            continue;
                        };
                        let result = match error {
                            Some(message) => Err(ClientError::Remote(message)),
                            None => Ok(emit_events.into_iter().map(decode_emit).collect()),
                        };
                        let _ = sender.send(result);
                    }
                    Ok(PluginFrame::HostCall { id, call }) => {
                        let client = Arc::clone(&client);
                        let host_fns = host_fns.clone();
                        tokio::spawn(async move {
                            let frame = match host_fns.dispatch_wire_call(&client.plugin, call) {
                                Ok(ok) => HostFrame::HostResult {
                                    id,
                                    ok: Some(ok),
                                    err: None,
                                },
                                Err(e) => HostFrame::HostResult {
                                    id,
                                    ok: None,
                                    err: Some(e.to_string()),
                                },
                            };
                            if let Err(e) = client.write_frame(&frame).await {
                                warn!(plugin = %client.plugin, error = %e, "failed to answer host call");
                            }
                        });
                    }
                    Ok(PluginFrame::Handshake { .. }) => {
                        warn!(plugin = %client.plugin, "unexpected mid-session handshake");
                    }
                    Err(e) => {
                        warn!(plugin = %client.plugin, error = %e, "malformed plugin frame: {line}");
                    }
                }
            }
            client.drain_pending().await;
        });
    }

    fn spawn_stderr_task(self: &Arc<Self>, stderr: ChildStderr) {
        let plugin = self.plugin.clone();
        let mut reader = BufReader::new(stderr).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = reader.next_line().await {
                warn!(plugin = %plugin, "plugin stderr: {line}");
            }
        });
    }

    async fn drain_pending(&self) {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return;
        }
        warn!(plugin = %self.plugin, in_flight = pending.len(), "plugin disconnected with requests in flight");
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ClientError::Disconnected));
        }
    }
}

#[async_trait]
impl PluginClient for SubprocessClient {
    async fn handle_event(&self, event: &Event) -> Result<Vec<EmitEvent>, ClientError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = HostFrame::Request {
            id,
            event: encode_event(event),
        };
        if let Err(e) = self.write_frame(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Disconnected),
        }
    }

    async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Some(mut child) = child.take() {
            if let Err(e) = child.kill().await {
                warn!(plugin = %self.plugin, error = %e, "failed to kill plugin process");
            }
        }
        self.drain_pending().await;
    }
}

//! The contract every plugin host implements.
//!
//! A host owns one class of plugin runtime — sandboxed scripts or supervised
//! binaries. The manager routes manifests to hosts by plugin type; the
//! dispatcher calls back through [`PluginHost::deliver`] without knowing
//! which runtime is behind a plugin.
//!
//! # Lifecycle
//!
//! ```text
//! Fresh ──► Open (0..N plugins loaded) ──► Closed
//! ```
//!
//! `Closed` is terminal: every mutating operation on a closed host fails
//! with [`HostError::Closed`], and `close` itself is idempotent.
//!
//! # Concurrency
//!
//! `deliver` may run concurrently across plugins and events. Hosts serialise
//! their own plugin-table mutation but never hold a lock across I/O into a
//! plugin, so a stuck plugin cannot block `close` or `unload`. Callers
//! cancel a delivery by dropping its future.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use holomush_core::{EmitEvent, Event};

use crate::capability::CapabilityError;
use crate::manifest::{Manifest, ManifestError, PluginType};

/// Errors surfaced by host operations.
#[derive(Debug, Error)]
pub enum HostError {
    /// The plugin is already loaded in this host.
    #[error("plugin '{name}' is already loaded")]
    AlreadyLoaded {
        /// Plugin name.
        name: String,
    },

    /// The plugin is not loaded in this host.
    #[error("plugin '{name}' is not loaded")]
    NotLoaded {
        /// Plugin name.
        name: String,
    },

    /// The host has been closed.
    #[error("host is closed")]
    Closed,

    /// The manifest was rejected.
    #[error(transparent)]
    BadManifest(#[from] ManifestError),

    /// A capability grant could not be installed.
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    /// The plugin runtime could not be brought up: interpreter construction,
    /// subprocess startup, or handshake.
    #[error("runtime init failed for plugin '{name}': {reason}")]
    RuntimeInit {
        /// Plugin name.
        name: String,
        /// What failed.
        reason: String,
    },

    /// The plugin's handler failed: a runtime error, an RPC/transport
    /// failure, a timeout, or cancellation.
    #[error("handler failed for plugin '{name}': {reason}")]
    Handler {
        /// Plugin name.
        name: String,
        /// What failed.
        reason: String,
    },
}

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

/// One class of plugin runtime.
#[async_trait]
pub trait PluginHost: Send + Sync {
    /// The plugin type this host executes.
    fn plugin_type(&self) -> PluginType;

    /// Loads a plugin from its manifest and bundle directory.
    ///
    /// Validates that the manifest's type matches this host, initialises
    /// runtime state, and installs the manifest's capability grants.
    async fn load(&self, manifest: Manifest, dir: &Path) -> HostResult<()>;

    /// Tears down a loaded plugin and revokes its capabilities.
    async fn unload(&self, name: &str) -> HostResult<()>;

    /// Invokes the plugin's handler for one event and returns the validated
    /// emits it produced, in the order the plugin produced them.
    async fn deliver(&self, name: &str, event: &Event) -> HostResult<Vec<EmitEvent>>;

    /// Names of the plugins currently loaded.
    fn list(&self) -> Vec<String>;

    /// Shuts the host down, tearing down every loaded plugin and releasing
    /// all grants. Idempotent; the host is unusable afterwards.
    async fn close(&self) -> HostResult<()>;
}

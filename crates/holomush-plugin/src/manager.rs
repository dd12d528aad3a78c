//! Plugin discovery and aggregate lifecycle.
//!
//! [`PluginManager`] walks the plugins root, turns bundle directories into
//! validated [`DiscoveredPlugin`]s, and routes each manifest to the
//! registered host for its runtime type.
//!
//! Batch loading degrades gracefully: a broken manifest, a missing host, or
//! a single plugin's load failure is logged and skipped so the server can
//! start with whatever works. Strict callers use
//! [`discover`](PluginManager::discover) plus
//! [`load`](PluginManager::load) individually and get every error back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::host::{HostError, HostResult, PluginHost};
use crate::manifest::{Manifest, ManifestError, PluginType};

/// Conventional manifest file name inside a plugin bundle.
pub const MANIFEST_FILE: &str = "plugin.yaml";

/// A validated manifest paired with its absolute bundle directory.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// The validated manifest.
    pub manifest: Manifest,
    /// Absolute path of the bundle directory.
    pub dir: PathBuf,
}

struct ManagerState {
    closed: bool,
    /// Loaded plugin name → runtime type, for unload routing.
    loaded: HashMap<String, PluginType>,
}

/// Discovers plugin bundles and drives hosts through load/unload/close.
pub struct PluginManager {
    hosts: HashMap<PluginType, Arc<dyn PluginHost>>,
    state: RwLock<ManagerState>,
    host_version: semver::Version,
}

impl PluginManager {
    /// Creates a manager with no hosts registered, identifying itself with
    /// this crate's version for `engine` constraint checks.
    pub fn new() -> Self {
        Self::with_host_version(
            semver::Version::parse(env!("CARGO_PKG_VERSION"))
                .unwrap_or_else(|_| semver::Version::new(0, 0, 0)),
        )
    }

    /// Creates a manager that reports `host_version` to `engine` checks.
    pub fn with_host_version(host_version: semver::Version) -> Self {
        Self {
            hosts: HashMap::new(),
            state: RwLock::new(ManagerState {
                closed: false,
                loaded: HashMap::new(),
            }),
            host_version,
        }
    }

    /// Registers a host. One host per plugin type; the last registration
    /// wins.
    pub fn register_host(&mut self, host: Arc<dyn PluginHost>) {
        let plugin_type = host.plugin_type();
        if self.hosts.insert(plugin_type, host).is_some() {
            warn!(%plugin_type, "replacing previously registered host");
        }
    }

    /// Names of currently loaded plugins, across all hosts.
    pub fn loaded(&self) -> Vec<String> {
        self.state.read().loaded.keys().cloned().collect()
    }

    /// Walks `root` and returns every subdirectory with a valid manifest.
    ///
    /// Parse failures and missing manifests are logged and skipped. Results
    /// are sorted by plugin name so discovery order is stable.
    pub async fn discover(&self, root: &Path) -> Vec<DiscoveredPlugin> {
        let mut discovered = Vec::new();
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "cannot read plugins root");
                return discovered;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let manifest_path = dir.join(MANIFEST_FILE);
            let bytes = match tokio::fs::read(&manifest_path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(dir = %dir.display(), "skipping directory without a manifest");
                    continue;
                }
                Err(e) => {
                    warn!(path = %manifest_path.display(), error = %e, "skipping unreadable manifest");
                    continue;
                }
            };
            let manifest = match Manifest::parse(&bytes) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(path = %manifest_path.display(), error = %e, "skipping invalid manifest");
                    continue;
                }
            };
            let dir = match tokio::fs::canonicalize(&dir).await {
                Ok(dir) => dir,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping unresolvable bundle directory");
                    continue;
                }
            };
            discovered.push(DiscoveredPlugin { manifest, dir });
        }

        discovered.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
        discovered
    }

    /// Loads one discovered plugin through the host for its type.
    pub async fn load(&self, discovered: &DiscoveredPlugin) -> HostResult<()> {
        if self.state.read().closed {
            return Err(HostError::Closed);
        }
        let manifest = &discovered.manifest;
        if !manifest.engine_accepts(&self.host_version) {
            return Err(ManifestError::Field {
                field: "engine",
                reason: format!(
                    "host version {} does not satisfy '{}'",
                    self.host_version,
                    manifest.engine.as_deref().unwrap_or_default()
                ),
            }
            .into());
        }
        let host = self.hosts.get(&manifest.plugin_type).ok_or_else(|| {
            HostError::RuntimeInit {
                name: manifest.name.clone(),
                reason: format!("no host registered for type '{}'", manifest.plugin_type),
            }
        })?;

        host.load(manifest.clone(), &discovered.dir).await?;
        self.state
            .write()
            .loaded
            .insert(manifest.name.clone(), manifest.plugin_type);
        info!(plugin = %manifest.name, plugin_type = %manifest.plugin_type, "plugin loaded");
        Ok(())
    }

    /// Loads every discovered plugin, skipping failures.
    ///
    /// Returns the number of plugins that loaded. A single plugin's failure
    /// never fails the batch.
    pub async fn load_all(&self, discovered: Vec<DiscoveredPlugin>) -> usize {
        let mut count = 0;
        for plugin in &discovered {
            match self.load(plugin).await {
                Ok(()) => count += 1,
                Err(HostError::Closed) => {
                    warn!("manager closed during load_all");
                    break;
                }
                Err(e) => {
                    warn!(plugin = %plugin.manifest.name, error = %e, "skipping plugin that failed to load");
                }
            }
        }
        count
    }

    /// Unloads one plugin through the host that owns it.
    pub async fn unload(&self, name: &str) -> HostResult<()> {
        let plugin_type = {
            let state = self.state.read();
            if state.closed {
                return Err(HostError::Closed);
            }
            state
                .loaded
                .get(name)
                .copied()
                .ok_or_else(|| HostError::NotLoaded { name: name.into() })?
        };
        let host = self
            .hosts
            .get(&plugin_type)
            .ok_or_else(|| HostError::NotLoaded { name: name.into() })?;
        host.unload(name).await?;
        self.state.write().loaded.remove(name);
        Ok(())
    }

    /// Closes every registered host and clears the loaded table.
    ///
    /// The table is cleared even when a host fails to close, so a failed
    /// shutdown cannot leave stale state behind. Returns the first error.
    pub async fn close(&self) -> HostResult<()> {
        {
            let mut state = self.state.write();
            state.closed = true;
            state.loaded.clear();
        }
        let mut first_error = None;
        for host in self.hosts.values() {
            if let Err(e) = host.close().await
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

//! Supervised binary plugin host.
//!
//! One child process per loaded plugin, speaking the versioned wire protocol
//! from `holomush-plugin-sdk` over stdio. The host owns the full child
//! lifecycle: containment-checked launch, handshake, per-call timeout, and
//! an unconditional kill on unload or close.
//!
//! ```text
//! NotLoaded ──► Starting ──► Ready ──► Terminating ──► NotLoaded
//! ```
//!
//! Deliver is legal only in `Ready`. An RPC failure leaves the plugin in
//! `Ready`; the supervisor is free to kill it on a later failure. RPCs are
//! issued without holding the host lock, so `close` and `unload` can always
//! preempt a stuck call by killing the child — the outstanding RPC then
//! fails naturally.

mod client;
mod path;

pub use client::{ClientError, ClientFactory, PluginClient, SubprocessFactory};
pub use path::{LaunchError, resolve_executable};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use holomush_core::{EmitEvent, Event};

use crate::capability::CapabilityEnforcer;
use crate::host::{HostError, HostResult, PluginHost};
use crate::hostfn::HostFunctions;
use crate::manifest::{Manifest, ManifestError, PluginType};

/// Default bound on one event delivery RPC.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

struct BinaryPlugin {
    manifest: Arc<Manifest>,
    client: Arc<dyn PluginClient>,
}

struct State {
    closed: bool,
    plugins: HashMap<String, BinaryPlugin>,
}

/// Host for supervised out-of-process plugins.
pub struct BinaryHost {
    state: RwLock<State>,
    factory: Arc<dyn ClientFactory>,
    host_fns: Arc<HostFunctions>,
    enforcer: Arc<CapabilityEnforcer>,
    call_timeout: Duration,
}

impl BinaryHost {
    /// Creates a host that spawns real subprocesses.
    pub fn new(host_fns: Arc<HostFunctions>, enforcer: Arc<CapabilityEnforcer>) -> Self {
        Self::with_factory(Arc::new(SubprocessFactory), host_fns, enforcer)
    }

    /// Creates a host with an injected client factory.
    pub fn with_factory(
        factory: Arc<dyn ClientFactory>,
        host_fns: Arc<HostFunctions>,
        enforcer: Arc<CapabilityEnforcer>,
    ) -> Self {
        Self {
            state: RwLock::new(State {
                closed: false,
                plugins: HashMap::new(),
            }),
            factory,
            host_fns,
            enforcer,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Overrides the per-delivery RPC timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Manifest of a loaded plugin, if present.
    pub fn manifest(&self, name: &str) -> Option<Arc<Manifest>> {
        self.state.read().plugins.get(name).map(|p| p.manifest.clone())
    }

    fn revoke_grants(&self, name: &str) {
        // The child is already dead; a failed revocation is log-only.
        if let Err(e) = self.enforcer.remove_grants(name) {
            warn!(plugin = %name, error = %e, "failed to revoke grants");
        }
    }
}

#[async_trait::async_trait]
impl PluginHost for BinaryHost {
    fn plugin_type(&self) -> PluginType {
        PluginType::Binary
    }

    async fn load(&self, manifest: Manifest, dir: &Path) -> HostResult<()> {
        if manifest.plugin_type != PluginType::Binary {
            return Err(ManifestError::Field {
                field: "type",
                reason: format!("host runs binary plugins, manifest says '{}'", manifest.plugin_type),
            }
            .into());
        }
        let name = manifest.name.clone();
        {
            let state = self.state.read();
            if state.closed {
                return Err(HostError::Closed);
            }
            if state.plugins.contains_key(&name) {
                return Err(HostError::AlreadyLoaded { name });
            }
        }

        // Containment is proven before anything is spawned.
        let executable = manifest
            .binary_config
            .as_ref()
            .map(|c| resolve_executable(dir, &c.executable))
            .transpose()
            .map_err(|e| HostError::RuntimeInit {
                name: name.clone(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| ManifestError::Field {
                field: "binary-config",
                reason: "required for type 'binary'".into(),
            })?;

        let client = self
            .factory
            .connect(&manifest, &executable, self.host_fns.clone())
            .await
            .map_err(|e| HostError::RuntimeInit {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        // A grant failure undoes the load; the child must not outlive it.
        if let Err(e) = self
            .enforcer
            .set_grants(&name, manifest.capabilities.iter().cloned())
        {
            client.shutdown().await;
            return Err(e.into());
        }

        let stale = {
            let mut state = self.state.write();
            if state.closed {
                Some((HostError::Closed, true))
            } else if state.plugins.contains_key(&name) {
                Some((HostError::AlreadyLoaded { name: name.clone() }, false))
            } else {
                state.plugins.insert(
                    name.clone(),
                    BinaryPlugin {
                        manifest: Arc::new(manifest),
                        client: client.clone(),
                    },
                );
                None
            }
        };
        if let Some((err, revoke)) = stale {
            client.shutdown().await;
            if revoke {
                self.revoke_grants(&name);
            }
            return Err(err);
        }
        debug!(plugin = %name, executable = %executable.display(), "binary plugin loaded");
        Ok(())
    }

    async fn unload(&self, name: &str) -> HostResult<()> {
        let plugin = {
            let mut state = self.state.write();
            if state.closed {
                return Err(HostError::Closed);
            }
            state
                .plugins
                .remove(name)
                .ok_or_else(|| HostError::NotLoaded { name: name.into() })?
        };
        // Kill first; grants go second so a wedged child can't hold them.
        plugin.client.shutdown().await;
        self.revoke_grants(name);
        debug!(plugin = %name, "binary plugin unloaded");
        Ok(())
    }

    async fn deliver(&self, name: &str, event: &Event) -> HostResult<Vec<EmitEvent>> {
        // Copy the client under the read lock; the RPC runs outside it.
        let client = {
            let state = self.state.read();
            if state.closed {
                return Err(HostError::Closed);
            }
            state
                .plugins
                .get(name)
                .map(|p| p.client.clone())
                .ok_or_else(|| HostError::NotLoaded { name: name.into() })?
        };

        let emits = match tokio::time::timeout(self.call_timeout, client.handle_event(event)).await
        {
            Err(_) => {
                return Err(HostError::Handler {
                    name: name.into(),
                    reason: format!("delivery timed out after {:?}", self.call_timeout),
                });
            }
            Ok(Err(e)) => {
                return Err(HostError::Handler {
                    name: name.into(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(emits)) => emits,
        };

        let mut accepted = Vec::with_capacity(emits.len());
        for emit in emits {
            match emit.validate() {
                Ok(()) => accepted.push(emit),
                Err(e) => warn!(plugin = %name, error = %e, "dropping invalid emit"),
            }
        }
        Ok(accepted)
    }

    fn list(&self) -> Vec<String> {
        self.state.read().plugins.keys().cloned().collect()
    }

    async fn close(&self) -> HostResult<()> {
        let drained: Vec<(String, BinaryPlugin)> = {
            let mut state = self.state.write();
            state.closed = true;
            state.plugins.drain().collect()
        };
        for (name, plugin) in drained {
            plugin.client.shutdown().await;
            self.revoke_grants(&name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holomush_core::ActorKind;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeClient {
        emits: Vec<EmitEvent>,
        delay: Option<Duration>,
        fail_with: Option<ClientError>,
        calls: AtomicUsize,
        killed: AtomicBool,
    }

    impl FakeClient {
        fn returning(emits: Vec<EmitEvent>) -> Arc<Self> {
            Arc::new(Self {
                emits,
                delay: None,
                fail_with: None,
                calls: AtomicUsize::new(0),
                killed: AtomicBool::new(false),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                emits: Vec::new(),
                delay: Some(delay),
                fail_with: None,
                calls: AtomicUsize::new(0),
                killed: AtomicBool::new(false),
            })
        }

        fn failing(error: ClientError) -> Arc<Self> {
            Arc::new(Self {
                emits: Vec::new(),
                delay: None,
                fail_with: Some(error),
                calls: AtomicUsize::new(0),
                killed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl PluginClient for FakeClient {
        async fn handle_event(&self, _event: &Event) -> Result<Vec<EmitEvent>, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(self.emits.clone()),
            }
        }

        async fn shutdown(&self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeFactory {
        client: Arc<FakeClient>,
        connects: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ClientFactory for FakeFactory {
        async fn connect(
            &self,
            _manifest: &Manifest,
            _executable: &Path,
            _host_fns: Arc<HostFunctions>,
        ) -> Result<Arc<dyn PluginClient>, ClientError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.client.clone())
        }
    }

    fn manifest(name: &str) -> Manifest {
        Manifest::parse(
            format!(
                "name: {name}\nversion: 1.0.0\ntype: binary\ncapabilities: [kv.read]\nbinary-config:\n  executable: run\n"
            )
            .as_bytes(),
        )
        .unwrap()
    }

    fn bundle_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("run");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        dir
    }

    fn host_with(client: Arc<FakeClient>) -> (BinaryHost, Arc<FakeFactory>, Arc<CapabilityEnforcer>) {
        let enforcer = Arc::new(CapabilityEnforcer::new());
        let host_fns = Arc::new(HostFunctions::builder().build(enforcer.clone()));
        let factory = Arc::new(FakeFactory {
            client,
            connects: AtomicUsize::new(0),
        });
        let host = BinaryHost::with_factory(factory.clone(), host_fns, enforcer.clone());
        (host, factory, enforcer)
    }

    fn event() -> Event {
        Event {
            id: 1,
            stream: "location:123".into(),
            event_type: "say".into(),
            timestamp: 0,
            actor_kind: ActorKind::Character,
            actor_id: String::new(),
            payload: "{}".into(),
        }
    }

    #[tokio::test]
    async fn load_deliver_unload_round_trip() {
        let client = FakeClient::returning(vec![EmitEvent::new("location:123", "say", "hi")]);
        let (host, factory, enforcer) = host_with(client.clone());
        let dir = bundle_dir();

        host.load(manifest("bridge"), dir.path()).await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
        assert!(enforcer.check("bridge", "kv.read"));
        assert_eq!(host.list(), vec!["bridge".to_string()]);

        let emits = host.deliver("bridge", &event()).await.unwrap();
        assert_eq!(emits.len(), 1);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        host.unload("bridge").await.unwrap();
        assert!(client.killed.load(Ordering::SeqCst));
        assert!(!enforcer.check("bridge", "kv.read"));
        assert!(host.list().is_empty());
    }

    #[tokio::test]
    async fn duplicate_load_is_rejected() {
        let (host, _, _) = host_with(FakeClient::returning(Vec::new()));
        let dir = bundle_dir();
        host.load(manifest("bridge"), dir.path()).await.unwrap();
        assert!(matches!(
            host.load(manifest("bridge"), dir.path()).await,
            Err(HostError::AlreadyLoaded { .. })
        ));
    }

    #[tokio::test]
    async fn wrong_type_is_rejected_before_spawn() {
        let (host, factory, _) = host_with(FakeClient::returning(Vec::new()));
        let script = Manifest::parse(
            b"name: s\nversion: 1.0.0\ntype: script\nscript-config:\n  entry: main.lua\n",
        )
        .unwrap();
        assert!(matches!(
            host.load(script, Path::new(".")).await,
            Err(HostError::BadManifest(_))
        ));
        assert_eq!(factory.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_executable_fails_before_spawn() {
        let (host, factory, enforcer) = host_with(FakeClient::returning(Vec::new()));
        let dir = tempfile::tempdir().unwrap();
        let err = host.load(manifest("bridge"), dir.path()).await.unwrap_err();
        match err {
            HostError::RuntimeInit { reason, .. } => assert!(reason.contains("not found")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(factory.connects.load(Ordering::SeqCst), 0);
        assert!(!enforcer.check("bridge", "kv.read"));
    }

    #[tokio::test]
    async fn slow_delivery_times_out() {
        let client = FakeClient::slow(Duration::from_secs(10));
        let (host, _, _) = host_with(client);
        let host = host.with_call_timeout(Duration::from_millis(20));
        let dir = bundle_dir();
        host.load(manifest("bridge"), dir.path()).await.unwrap();

        let err = host.deliver("bridge", &event()).await.unwrap_err();
        match err {
            HostError::Handler { reason, .. } => assert!(reason.contains("timed out")),
            other => panic!("unexpected error: {other}"),
        }
        // A failed RPC leaves the plugin loaded.
        assert_eq!(host.list(), vec!["bridge".to_string()]);
    }

    #[tokio::test]
    async fn remote_errors_surface_as_handler_errors() {
        let client = FakeClient::failing(ClientError::Remote("boom".into()));
        let (host, _, _) = host_with(client);
        let dir = bundle_dir();
        host.load(manifest("bridge"), dir.path()).await.unwrap();
        assert!(matches!(
            host.deliver("bridge", &event()).await,
            Err(HostError::Handler { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_emits_are_dropped() {
        let client = FakeClient::returning(vec![
            EmitEvent::new("location:123", "say", "ok"),
            EmitEvent::new("", "say", "dropped"),
        ]);
        let (host, _, _) = host_with(client);
        let dir = bundle_dir();
        host.load(manifest("bridge"), dir.path()).await.unwrap();

        let emits = host.deliver("bridge", &event()).await.unwrap();
        assert_eq!(emits.len(), 1);
        assert_eq!(emits[0].payload, "ok");
    }

    #[tokio::test]
    async fn close_kills_children_and_is_idempotent() {
        let client = FakeClient::returning(Vec::new());
        let (host, _, enforcer) = host_with(client.clone());
        let dir = bundle_dir();
        host.load(manifest("bridge"), dir.path()).await.unwrap();

        host.close().await.unwrap();
        assert!(client.killed.load(Ordering::SeqCst));
        assert!(!enforcer.check("bridge", "kv.read"));
        host.close().await.unwrap();

        assert!(matches!(
            host.load(manifest("other"), dir.path()).await,
            Err(HostError::Closed)
        ));
        assert!(matches!(
            host.deliver("bridge", &event()).await,
            Err(HostError::Closed)
        ));
        assert!(matches!(host.unload("bridge").await, Err(HostError::Closed)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_never_spawns() {
        let outer = tempfile::tempdir().unwrap();
        let outside = outer.path().join("outside");
        std::fs::write(&outside, "#!/bin/sh\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&outside, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let bundle = outer.path().join("bundle");
        std::fs::create_dir(&bundle).unwrap();
        std::os::unix::fs::symlink(&outside, bundle.join("run")).unwrap();

        let (host, factory, enforcer) = host_with(FakeClient::returning(Vec::new()));
        let err = host.load(manifest("sneaky"), &bundle).await.unwrap_err();
        match err {
            HostError::RuntimeInit { reason, .. } => {
                assert!(reason.contains("escapes the plugin directory"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(factory.connects.load(Ordering::SeqCst), 0);
        assert!(!enforcer.check("sneaky", "kv.read"));
    }
}

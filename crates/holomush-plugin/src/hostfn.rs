//! Host functions: the narrow, capability-gated surface plugins call back
//! into the server through.
//!
//! Both runtimes share this layer. The script host exposes it to Lua as the
//! `holomush` global table; the binary host answers host-call frames with
//! it. A capability check precedes every gated call; a denial is returned
//! *to the plugin* as an error value — it never aborts the handler.
//!
//! Dependencies are injected at construction time through
//! [`HostFunctions::builder`]. Every dependency is optional; calls whose
//! backing service is absent report "unavailable" instead of failing the
//! delivery. The emitter is the one-method [`PluginEventEmitter`] trait
//! rather than the dispatcher itself, which keeps the dispatcher → host →
//! host-functions reference chain acyclic.

use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use holomush_core::{EmitEvent, PluginEventEmitter, new_request_id, stream_scope};
use holomush_plugin_sdk::wire::{HostCall, LogLevel};

use crate::capability::CapabilityEnforcer;

// ============================================================================
// Injected services
// ============================================================================

/// An injected service failed.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

/// Namespaced key/value storage scoped per plugin. Backed externally.
pub trait KvStore: Send + Sync {
    /// Reads a key from the plugin's namespace.
    fn get(&self, plugin: &str, key: &str) -> Result<Option<String>, ServiceError>;
    /// Writes a key in the plugin's namespace.
    fn set(&self, plugin: &str, key: &str, value: &str) -> Result<(), ServiceError>;
    /// Deletes a key from the plugin's namespace.
    fn delete(&self, plugin: &str, key: &str) -> Result<(), ServiceError>;
}

/// Read-only world lookups. Backed externally.
pub trait WorldQuery: Send + Sync {
    /// Looks up a room record.
    fn room(&self, id: &str) -> Result<Option<Value>, ServiceError>;
    /// Looks up a character record.
    fn character(&self, id: &str) -> Result<Option<Value>, ServiceError>;
    /// Lists the characters present in a room.
    fn room_characters(&self, id: &str) -> Result<Vec<Value>, ServiceError>;
}

/// A command known to the server's registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommandInfo {
    /// Command name.
    pub name: String,
    /// Help text, possibly empty.
    pub help: String,
}

/// Introspection over registered commands. Backed externally.
pub trait CommandRegistry: Send + Sync {
    /// All registered commands.
    fn list(&self) -> Vec<CommandInfo>;
    /// One command by exact name.
    fn get(&self, name: &str) -> Option<CommandInfo>;
}

// ============================================================================
// Errors
// ============================================================================

/// Errors returned to the plugin from a host-function call.
///
/// The `Display` string is what the plugin sees as the second element of its
/// `(nil, err)` return, so these messages are part of the plugin-facing API.
#[derive(Debug, Clone, Error)]
pub enum HostFnError {
    /// The plugin lacks the required capability.
    #[error("capability denied: {capability}")]
    Denied {
        /// The capability that was checked.
        capability: String,
    },

    /// The backing service was not wired into this host.
    #[error("{what} unavailable")]
    Unavailable {
        /// Which service.
        what: &'static str,
    },

    /// The call was malformed.
    #[error("invalid call: {0}")]
    Invalid(String),

    /// The backing service failed.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Result type for host-function calls.
pub type HostFnResult<T> = Result<T, HostFnError>;

// ============================================================================
// HostFunctions
// ============================================================================

/// The host-function surface bound to one host instance.
pub struct HostFunctions {
    enforcer: Arc<CapabilityEnforcer>,
    emitter: Option<Arc<dyn PluginEventEmitter>>,
    kv: Option<Arc<dyn KvStore>>,
    world: Option<Arc<dyn WorldQuery>>,
    commands: Option<Arc<dyn CommandRegistry>>,
}

/// Builder for [`HostFunctions`]; every service is optional.
#[derive(Default)]
pub struct HostFunctionsBuilder {
    emitter: Option<Arc<dyn PluginEventEmitter>>,
    kv: Option<Arc<dyn KvStore>>,
    world: Option<Arc<dyn WorldQuery>>,
    commands: Option<Arc<dyn CommandRegistry>>,
}

impl HostFunctionsBuilder {
    /// Wires in the emitter used by `emit_event`.
    pub fn emitter(mut self, emitter: Arc<dyn PluginEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Wires in the key/value store.
    pub fn kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Wires in the world-query service.
    pub fn world(mut self, world: Arc<dyn WorldQuery>) -> Self {
        self.world = Some(world);
        self
    }

    /// Wires in the command registry.
    pub fn commands(mut self, commands: Arc<dyn CommandRegistry>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Finishes the build against the given enforcer.
    pub fn build(self, enforcer: Arc<CapabilityEnforcer>) -> HostFunctions {
        HostFunctions {
            enforcer,
            emitter: self.emitter,
            kv: self.kv,
            world: self.world,
            commands: self.commands,
        }
    }
}

impl HostFunctions {
    /// Starts a builder.
    pub fn builder() -> HostFunctionsBuilder {
        HostFunctionsBuilder::default()
    }

    fn require(&self, plugin: &str, capability: String) -> HostFnResult<()> {
        if self.enforcer.check(plugin, &capability) {
            trace!(plugin, capability, "capability allowed");
            Ok(())
        } else {
            debug!(plugin, capability, "capability denied");
            Err(HostFnError::Denied { capability })
        }
    }

    // ─── Implicit calls ──────────────────────────────────────────────────

    /// Emits a structured log record tagged with the plugin name.
    pub fn log(&self, plugin: &str, level: LogLevel, message: &str, fields: &Value) {
        match level {
            LogLevel::Debug => debug!(plugin, fields = %fields, "{message}"),
            LogLevel::Warn => warn!(plugin, fields = %fields, "{message}"),
            LogLevel::Error => error!(plugin, fields = %fields, "{message}"),
            LogLevel::Info | LogLevel::Unspecified => {
                info!(plugin, fields = %fields, "{message}")
            }
        }
    }

    /// Mints a fresh request identifier.
    pub fn new_request_id(&self) -> String {
        new_request_id()
    }

    // ─── Key/value ───────────────────────────────────────────────────────

    /// Reads a key from the plugin's namespaced store. Requires `kv.read`.
    pub fn kv_get(&self, plugin: &str, key: &str) -> HostFnResult<Option<String>> {
        self.require(plugin, "kv.read".to_string())?;
        let kv = self.kv.as_ref().ok_or(HostFnError::Unavailable {
            what: "key-value store",
        })?;
        Ok(kv.get(plugin, key)?)
    }

    /// Writes a key in the plugin's namespaced store. Requires `kv.write`.
    pub fn kv_set(&self, plugin: &str, key: &str, value: &str) -> HostFnResult<()> {
        self.require(plugin, "kv.write".to_string())?;
        let kv = self.kv.as_ref().ok_or(HostFnError::Unavailable {
            what: "key-value store",
        })?;
        Ok(kv.set(plugin, key, value)?)
    }

    /// Deletes a key from the plugin's namespaced store. Requires `kv.write`.
    pub fn kv_delete(&self, plugin: &str, key: &str) -> HostFnResult<()> {
        self.require(plugin, "kv.write".to_string())?;
        let kv = self.kv.as_ref().ok_or(HostFnError::Unavailable {
            what: "key-value store",
        })?;
        Ok(kv.delete(plugin, key)?)
    }

    // ─── Emits ───────────────────────────────────────────────────────────

    /// Publishes a side-channel emit on behalf of the plugin.
    ///
    /// Requires `events.emit.<scope>` where the scope is the target
    /// stream's address family (`location:123` → `events.emit.location`).
    pub fn emit_event(
        &self,
        plugin: &str,
        stream: &str,
        event_type: &str,
        payload: &str,
    ) -> HostFnResult<()> {
        let emit = EmitEvent::new(stream, event_type, payload);
        emit.validate()
            .map_err(|e| HostFnError::Invalid(e.to_string()))?;
        self.require(plugin, format!("events.emit.{}", stream_scope(stream)))?;
        let emitter = self
            .emitter
            .as_ref()
            .ok_or(HostFnError::Unavailable { what: "emitter" })?;
        emitter
            .emit_plugin_event(plugin, &emit)
            .map_err(|e| HostFnError::Service(ServiceError(e.to_string())))
    }

    // ─── World queries ───────────────────────────────────────────────────

    /// Looks up a room record. Requires `world.read.room`.
    pub fn query_room(&self, plugin: &str, id: &str) -> HostFnResult<Value> {
        self.require(plugin, "world.read.room".to_string())?;
        let world = self.world.as_ref().ok_or(HostFnError::Unavailable {
            what: "world query service",
        })?;
        Ok(world.room(id)?.unwrap_or(Value::Null))
    }

    /// Looks up a character record. Requires `world.read.character`.
    pub fn query_character(&self, plugin: &str, id: &str) -> HostFnResult<Value> {
        self.require(plugin, "world.read.character".to_string())?;
        let world = self.world.as_ref().ok_or(HostFnError::Unavailable {
            what: "world query service",
        })?;
        Ok(world.character(id)?.unwrap_or(Value::Null))
    }

    /// Lists the characters present in a room. Requires `world.read.room`.
    pub fn query_room_characters(&self, plugin: &str, id: &str) -> HostFnResult<Value> {
        self.require(plugin, "world.read.room".to_string())?;
        let world = self.world.as_ref().ok_or(HostFnError::Unavailable {
            what: "world query service",
        })?;
        Ok(Value::Array(world.room_characters(id)?))
    }

    // ─── Command introspection ───────────────────────────────────────────

    /// Lists registered commands.
    pub fn list_commands(&self) -> HostFnResult<Value> {
        let registry = self.commands.as_ref().ok_or(HostFnError::Unavailable {
            what: "command registry",
        })?;
        Ok(json!(registry.list()))
    }

    /// Case-insensitive substring search over command names and help text.
    pub fn search_commands(&self, query: &str) -> HostFnResult<Value> {
        let registry = self.commands.as_ref().ok_or(HostFnError::Unavailable {
            what: "command registry",
        })?;
        let needle = query.to_lowercase();
        let hits: Vec<CommandInfo> = registry
            .list()
            .into_iter()
            .filter(|c| {
                c.name.to_lowercase().contains(&needle)
                    || c.help.to_lowercase().contains(&needle)
            })
            .collect();
        Ok(json!(hits))
    }

    /// Fetches one command by name; `null` when absent.
    pub fn get_command(&self, name: &str) -> HostFnResult<Value> {
        let registry = self.commands.as_ref().ok_or(HostFnError::Unavailable {
            what: "command registry",
        })?;
        Ok(registry.get(name).map(|c| json!(c)).unwrap_or(Value::Null))
    }

    // ─── Wire dispatch ───────────────────────────────────────────────────

    /// Dispatches a host call received from a binary plugin.
    pub fn dispatch_wire_call(&self, plugin: &str, call: HostCall) -> HostFnResult<Value> {
        match call {
            HostCall::Log {
                level,
                message,
                fields,
            } => {
                self.log(plugin, level, &message, &fields);
                Ok(Value::Null)
            }
            HostCall::NewRequestId => Ok(Value::String(self.new_request_id())),
            HostCall::KvGet { key } => Ok(self
                .kv_get(plugin, &key)?
                .map(Value::String)
                .unwrap_or(Value::Null)),
            HostCall::KvSet { key, value } => {
                self.kv_set(plugin, &key, &value)?;
                Ok(Value::Null)
            }
            HostCall::KvDelete { key } => {
                self.kv_delete(plugin, &key)?;
                Ok(Value::Null)
            }
            HostCall::EmitEvent {
                stream,
                event_type,
                payload,
            } => {
                self.emit_event(plugin, &stream, &event_type, &payload)?;
                Ok(Value::Null)
            }
            HostCall::QueryRoom { id } => self.query_room(plugin, &id),
            HostCall::QueryCharacter { id } => self.query_character(plugin, &id),
            HostCall::QueryRoomCharacters { id } => self.query_room_characters(plugin, &id),
            HostCall::ListCommands => self.list_commands(),
            HostCall::SearchCommands { query } => self.search_commands(&query),
            HostCall::GetCommand { name } => self.get_command(&name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MemoryKv {
        entries: Mutex<HashMap<(String, String), String>>,
    }

    impl MemoryKv {
        fn new() -> Self {
            Self {
                entries: Mutex::new(HashMap::new()),
            }
        }
    }

    impl KvStore for MemoryKv {
        fn get(&self, plugin: &str, key: &str) -> Result<Option<String>, ServiceError> {
            Ok(self
                .entries
                .lock()
                .get(&(plugin.to_string(), key.to_string()))
                .cloned())
        }

        fn set(&self, plugin: &str, key: &str, value: &str) -> Result<(), ServiceError> {
            self.entries
                .lock()
                .insert((plugin.to_string(), key.to_string()), value.to_string());
            Ok(())
        }

        fn delete(&self, plugin: &str, key: &str) -> Result<(), ServiceError> {
            self.entries
                .lock()
                .remove(&(plugin.to_string(), key.to_string()));
            Ok(())
        }
    }

    struct SinkEmitter {
        emits: Mutex<Vec<(String, EmitEvent)>>,
    }

    impl PluginEventEmitter for SinkEmitter {
        fn emit_plugin_event(
            &self,
            plugin: &str,
            emit: &EmitEvent,
        ) -> holomush_core::EmitResult {
            self.emits.lock().push((plugin.to_string(), emit.clone()));
            Ok(())
        }
    }

    fn enforcer_with(plugin: &str, patterns: &[&str]) -> Arc<CapabilityEnforcer> {
        let enforcer = Arc::new(CapabilityEnforcer::new());
        enforcer.set_grants(plugin, patterns.iter().copied()).unwrap();
        enforcer
    }

    #[test]
    fn kv_round_trip_with_grants() {
        let fns = HostFunctions::builder()
            .kv(Arc::new(MemoryKv::new()))
            .build(enforcer_with("echo", &["kv.read", "kv.write"]));

        fns.kv_set("echo", "greeting", "salve").unwrap();
        assert_eq!(fns.kv_get("echo", "greeting").unwrap().as_deref(), Some("salve"));
        fns.kv_delete("echo", "greeting").unwrap();
        assert_eq!(fns.kv_get("echo", "greeting").unwrap(), None);
    }

    #[test]
    fn denial_message_names_the_capability() {
        let fns = HostFunctions::builder()
            .kv(Arc::new(MemoryKv::new()))
            .build(Arc::new(CapabilityEnforcer::new()));

        let err = fns.kv_get("echo", "greeting").unwrap_err();
        assert_eq!(err.to_string(), "capability denied: kv.read");
    }

    #[test]
    fn missing_service_reports_unavailable() {
        let fns = HostFunctions::builder().build(enforcer_with("echo", &["**"]));
        let err = fns.kv_get("echo", "greeting").unwrap_err();
        assert_eq!(err.to_string(), "key-value store unavailable");
        let err = fns.list_commands().unwrap_err();
        assert_eq!(err.to_string(), "command registry unavailable");
    }

    #[test]
    fn emit_capability_is_scoped_by_stream() {
        let emitter = Arc::new(SinkEmitter {
            emits: Mutex::new(Vec::new()),
        });
        let fns = HostFunctions::builder()
            .emitter(emitter.clone())
            .build(enforcer_with("echo", &["events.emit.location"]));

        fns.emit_event("echo", "location:123", "say", "{}").unwrap();
        let err = fns
            .emit_event("echo", "character:123", "say", "{}")
            .unwrap_err();
        assert_eq!(err.to_string(), "capability denied: events.emit.character");
        assert_eq!(emitter.emits.lock().len(), 1);
    }

    #[test]
    fn emit_rejects_missing_fields_before_the_capability_check() {
        let fns = HostFunctions::builder().build(enforcer_with("echo", &["**"]));
        let err = fns.emit_event("echo", "", "say", "{}").unwrap_err();
        assert!(matches!(err, HostFnError::Invalid(_)));
    }

    #[test]
    fn command_search_is_case_insensitive() {
        struct FixedRegistry;
        impl CommandRegistry for FixedRegistry {
            fn list(&self) -> Vec<CommandInfo> {
                vec![
                    CommandInfo {
                        name: "say".into(),
                        help: "Speak to the room.".into(),
                    },
                    CommandInfo {
                        name: "pose".into(),
                        help: "Emote an action.".into(),
                    },
                ]
            }
            fn get(&self, name: &str) -> Option<CommandInfo> {
                self.list().into_iter().find(|c| c.name == name)
            }
        }

        let fns = HostFunctions::builder()
            .commands(Arc::new(FixedRegistry))
            .build(Arc::new(CapabilityEnforcer::new()));

        let hits = fns.search_commands("SPEAK").unwrap();
        assert_eq!(hits.as_array().unwrap().len(), 1);
        assert_eq!(fns.get_command("pose").unwrap()["name"], "pose");
        assert_eq!(fns.get_command("missing").unwrap(), Value::Null);
    }

    #[test]
    fn wire_dispatch_routes_to_the_same_surface() {
        let fns = HostFunctions::builder()
            .kv(Arc::new(MemoryKv::new()))
            .build(enforcer_with("bridge", &["kv.read", "kv.write"]));

        fns.dispatch_wire_call(
            "bridge",
            HostCall::KvSet {
                key: "k".into(),
                value: "v".into(),
            },
        )
        .unwrap();
        let got = fns
            .dispatch_wire_call("bridge", HostCall::KvGet { key: "k".into() })
            .unwrap();
        assert_eq!(got, Value::String("v".into()));

        let id = fns.dispatch_wire_call("bridge", HostCall::NewRequestId).unwrap();
        assert!(holomush_core::is_ulid_shaped(id.as_str().unwrap()));
    }
}

//! Sandboxed script host.
//!
//! Script plugins run in a fresh Lua interpreter built **per event
//! delivery**. Per-event state gives at-most-one-writer semantics for free,
//! bounds interpreter memory to a single delivery, and makes cross-event
//! leakage of globals impossible; the construction cost is small next to the
//! handler itself.
//!
//! # Sandbox
//!
//! The interpreter opens only the base, table, string, and math libraries.
//! Filesystem, process, debug, and module loading are absent, and the four
//! base entry points that load code from strings or files (`load`,
//! `loadfile`, `loadstring`, `dofile`) are unbound after construction.
//!
//! # Script ABI
//!
//! A plugin source defines `on_event(event)` and/or `on_command(ctx)`. Each
//! returns `nil` or a list of `{stream=..., type=..., payload=...}` tables.
//! The `holomush` global exposes the host functions. The top level of the
//! source runs once per delivery, so it must be side-effect-free or
//! idempotent.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use mlua::{Function, Lua, LuaOptions, LuaSerdeExt, StdLib, Table, Value};
use parking_lot::RwLock;
use tracing::{debug, warn};

use holomush_core::{CommandContext, EmitEvent, EmitValidationError, Event};
use holomush_plugin_sdk::wire::LogLevel;

use crate::capability::CapabilityEnforcer;
use crate::host::{HostError, HostResult, PluginHost};
use crate::hostfn::HostFunctions;
use crate::manifest::{Manifest, ManifestError, PluginType};

/// Base-library globals that can load code; unbound from every sandbox.
const CODE_LOADERS: [&str; 4] = ["load", "loadfile", "loadstring", "dofile"];

struct ScriptPlugin {
    manifest: Arc<Manifest>,
    /// Entry source, re-executed in a fresh interpreter per delivery.
    source: Arc<str>,
}

struct State {
    closed: bool,
    plugins: HashMap<String, ScriptPlugin>,
}

/// Host for sandboxed script plugins.
pub struct ScriptHost {
    state: RwLock<State>,
    host_fns: Arc<HostFunctions>,
    enforcer: Arc<CapabilityEnforcer>,
}

impl ScriptHost {
    /// Creates a script host bound to the given host functions and enforcer.
    pub fn new(host_fns: Arc<HostFunctions>, enforcer: Arc<CapabilityEnforcer>) -> Self {
        Self {
            state: RwLock::new(State {
                closed: false,
                plugins: HashMap::new(),
            }),
            host_fns,
            enforcer,
        }
    }
}

#[async_trait::async_trait]
impl PluginHost for ScriptHost {
    fn plugin_type(&self) -> PluginType {
        PluginType::Script
    }

    async fn load(&self, manifest: Manifest, dir: &Path) -> HostResult<()> {
        if manifest.plugin_type != PluginType::Script {
            return Err(ManifestError::Field {
                field: "type",
                reason: format!("host runs script plugins, manifest says '{}'", manifest.plugin_type),
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

        let entry = manifest
            .script_config
            .as_ref()
            .map(|c| dir.join(&c.entry))
            .ok_or_else(|| ManifestError::Field {
                field: "script-config",
                reason: "required for type 'script'".into(),
            })?;
        let source: Arc<str> = tokio::fs::read_to_string(&entry)
            .await
            .map_err(|e| HostError::RuntimeInit {
                name: name.clone(),
                reason: format!("cannot read entry '{}': {e}", entry.display()),
            })?
            .into();

        self.enforcer
            .set_grants(&name, manifest.capabilities.iter().cloned())?;

        // Trial execution catches broken sources before the plugin is live.
        let trial = {
            let name = name.clone();
            let source = source.clone();
            let host_fns = self.host_fns.clone();
            tokio::task::spawn_blocking(move || {
                let lua = build_sandbox().map_err(|e| e.to_string())?;
                register_host_api(&lua, &name, &host_fns).map_err(|e| e.to_string())?;
                lua.load(&*source)
                    .set_name(name.as_str())
                    .exec()
                    .map_err(|e| e.to_string())
            })
            .await
        };
        let trial = match trial {
            Ok(result) => result,
            Err(join) => Err(join.to_string()),
        };
        if let Err(reason) = trial {
            if let Err(e) = self.enforcer.remove_grants(&name) {
                warn!(plugin = %name, error = %e, "failed to revoke grants after load failure");
            }
            return Err(HostError::RuntimeInit { name, reason });
        }

        let mut state = self.state.write();
        if state.closed {
            drop(state);
            if let Err(e) = self.enforcer.remove_grants(&name) {
                warn!(plugin = %name, error = %e, "failed to revoke grants after load failure");
            }
            return Err(HostError::Closed);
        }
        if state.plugins.contains_key(&name) {
            return Err(HostError::AlreadyLoaded { name });
        }
        debug!(plugin = %name, entry = %entry.display(), "script plugin loaded");
        state.plugins.insert(
            name,
            ScriptPlugin {
                manifest: Arc::new(manifest),
                source,
            },
        );
        Ok(())
    }

    async fn unload(&self, name: &str) -> HostResult<()> {
        {
            let mut state = self.state.write();
            if state.closed {
                return Err(HostError::Closed);
            }
            if state.plugins.remove(name).is_none() {
                return Err(HostError::NotLoaded { name: name.into() });
            }
        }
        if let Err(e) = self.enforcer.remove_grants(name) {
            warn!(plugin = %name, error = %e, "failed to revoke grants on unload");
        }
        debug!(plugin = %name, "script plugin unloaded");
        Ok(())
    }

    async fn deliver(&self, name: &str, event: &Event) -> HostResult<Vec<EmitEvent>> {
        // Copy the source under the read lock, run outside it.
        let source = {
            let state = self.state.read();
            if state.closed {
                return Err(HostError::Closed);
            }
            state
                .plugins
                .get(name)
                .map(|p| p.source.clone())
                .ok_or_else(|| HostError::NotLoaded { name: name.into() })?
        };

        let plugin = name.to_string();
        let event = event.clone();
        let host_fns = self.host_fns.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            run_delivery(&plugin, &source, &host_fns, &event)
        })
        .await
        .map_err(|e| HostError::Handler {
            name: name.into(),
            reason: format!("delivery task failed: {e}"),
        })?;

        match outcome {
            Ok((emits, violations)) => {
                for violation in violations {
                    warn!(plugin = %name, error = %violation, "dropping invalid emit");
                }
                Ok(emits)
            }
            Err(DeliveryError::Init(reason)) => Err(HostError::RuntimeInit {
                name: name.into(),
                reason,
            }),
            Err(DeliveryError::Handler(reason)) => Err(HostError::Handler {
                name: name.into(),
                reason,
            }),
        }
    }

    fn list(&self) -> Vec<String> {
        self.state.read().plugins.keys().cloned().collect()
    }

    async fn close(&self) -> HostResult<()> {
        let drained: Vec<String> = {
            let mut state = self.state.write();
            state.closed = true;
            state.plugins.drain().map(|(name, _)| name).collect()
        };
        for name in drained {
            if let Err(e) = self.enforcer.remove_grants(&name) {
                warn!(plugin = %name, error = %e, "failed to revoke grants on close");
            }
        }
        Ok(())
    }
}

impl ScriptHost {
    /// Manifest of a loaded plugin, if present.
    pub fn manifest(&self, name: &str) -> Option<Arc<Manifest>> {
        self.state.read().plugins.get(name).map(|p| p.manifest.clone())
    }
}

// ============================================================================
// Delivery
// ============================================================================

#[derive(Debug)]
enum DeliveryError {
    Init(String),
    Handler(String),
}

fn run_delivery(
    plugin: &str,
    source: &str,
    host_fns: &Arc<HostFunctions>,
    event: &Event,
) -> Result<(Vec<EmitEvent>, Vec<EmitValidationError>), DeliveryError> {
    let lua = build_sandbox().map_err(|e| DeliveryError::Init(e.to_string()))?;
    register_host_api(&lua, plugin, host_fns)
        .map_err(|e| DeliveryError::Init(e.to_string()))?;

    lua.load(source)
        .set_name(plugin)
        .exec()
        .map_err(|e| DeliveryError::Handler(e.to_string()))?;

    let globals = lua.globals();
    let on_command: Option<Function> = globals
        .get("on_command")
        .map_err(|e| DeliveryError::Handler(e.to_string()))?;
    let on_event: Option<Function> = globals
        .get("on_event")
        .map_err(|e| DeliveryError::Handler(e.to_string()))?;

    let returned: Value = if event.is_command()
        && let Some(handler) = on_command
    {
        let ctx = CommandContext::from_event(event)
            .map_err(|e| DeliveryError::Handler(e.to_string()))?;
        let table = command_table(&lua, &ctx).map_err(|e| DeliveryError::Handler(e.to_string()))?;
        handler
            .call(table)
            .map_err(|e| DeliveryError::Handler(e.to_string()))?
    } else if let Some(handler) = on_event {
        let table = event_table(&lua, event).map_err(|e| DeliveryError::Handler(e.to_string()))?;
        handler
            .call(table)
            .map_err(|e| DeliveryError::Handler(e.to_string()))?
    } else {
        Value::Nil
    };

    Ok(decode_emits(returned))
    // The interpreter is dropped here, success or not.
}

/// Builds an interpreter with the restricted library set.
fn build_sandbox() -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH,
        LuaOptions::default(),
    )?;
    let globals = lua.globals();
    for name in CODE_LOADERS {
        globals.raw_set(name, Value::Nil)?;
    }
    Ok(lua)
}

fn event_table(lua: &Lua, event: &Event) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.set("id", event.id)?;
    t.set("stream", event.stream.as_str())?;
    t.set("type", event.event_type.as_str())?;
    t.set("timestamp", event.timestamp)?;
    t.set("actor_kind", event.actor_kind.as_str())?;
    t.set("actor_id", event.actor_id.as_str())?;
    t.set("payload", event.payload.as_str())?;
    Ok(t)
}

fn command_table(lua: &Lua, ctx: &CommandContext) -> mlua::Result<Table> {
    let t = lua.create_table()?;
    t.set("name", ctx.name.as_str())?;
    t.set("args", ctx.args.as_str())?;
    t.set("invoked_as", ctx.invoked_as.as_str())?;
    t.set("character_name", ctx.character_name.as_str())?;
    t.set("character_id", ctx.character_id.as_str())?;
    t.set("location_id", ctx.location_id.as_str())?;
    t.set("player_id", ctx.player_id.as_str())?;
    Ok(t)
}

/// Structurally decodes a handler return value into emits.
///
/// `nil` means no emits. Anything that is not a table is a violation. Table
/// entries are read at integer keys; each must itself be a table with
/// non-empty string `stream` and `type` fields (payload optional). Violating
/// entries are collected and skipped; valid entries still flow.
fn decode_emits(value: Value) -> (Vec<EmitEvent>, Vec<EmitValidationError>) {
    let table = match value {
        Value::Nil => return (Vec::new(), Vec::new()),
        Value::Table(t) => t,
        other => {
            return (
                Vec::new(),
                vec![EmitValidationError::BadShape {
                    reason: format!("handler returned {}, expected a table or nil", other.type_name()),
                }],
            );
        }
    };

    let mut emits = Vec::new();
    let mut violations = Vec::new();
    for i in 1..=table.raw_len() {
        let entry: Value = match table.raw_get(i) {
            Ok(v) => v,
            Err(e) => {
                violations.push(EmitValidationError::BadShape {
                    reason: format!("entry {i}: {e}"),
                });
                continue;
            }
        };
        match decode_emit_entry(entry) {
            Ok(emit) => emits.push(emit),
            Err(reason) => violations.push(EmitValidationError::BadShape {
                reason: format!("entry {i}: {reason}"),
            }),
        }
    }
    (emits, violations)
}

fn decode_emit_entry(entry: Value) -> Result<EmitEvent, String> {
    let Value::Table(entry) = entry else {
        return Err(format!("expected a table, got {}", entry.type_name()));
    };
    let stream = required_string(&entry, "stream")?;
    let event_type = required_string(&entry, "type")?;
    let payload = match entry.get::<Value>("payload").map_err(|e| e.to_string())? {
        Value::Nil => String::new(),
        Value::String(s) => s.to_string_lossy(),
        other => return Err(format!("field 'payload' is {}, expected a string", other.type_name())),
    };
    Ok(EmitEvent::new(stream, event_type, payload))
}

fn required_string(entry: &Table, field: &str) -> Result<String, String> {
    match entry.get::<Value>(field).map_err(|e| e.to_string())? {
        Value::String(s) => {
            let s = s.to_string_lossy();
            if s.is_empty() {
                Err(format!("field '{field}' is empty"))
            } else {
                Ok(s)
            }
        }
        Value::Nil => Err(format!("field '{field}' is missing")),
        other => Err(format!("field '{field}' is {}, expected a string", other.type_name())),
    }
}

// ============================================================================
// holomush.* bridge
// ============================================================================

fn parse_level(level: Option<&str>) -> LogLevel {
    match level {
        Some("debug") => LogLevel::Debug,
        Some("info") => LogLevel::Info,
        Some("warn") => LogLevel::Warn,
        Some("error") => LogLevel::Error,
        _ => LogLevel::Unspecified,
    }
}

/// Converts a host-function outcome into the Lua `(value, err)` convention.
fn lua_result(
    lua: &Lua,
    result: crate::hostfn::HostFnResult<serde_json::Value>,
) -> mlua::Result<(Value, Option<String>)> {
    match result {
        Ok(value) if value.is_null() => Ok((Value::Nil, None)),
        Ok(value) => Ok((lua.to_value(&value)?, None)),
        Err(e) => Ok((Value::Nil, Some(e.to_string()))),
    }
}

/// Registers the `holomush` global table on a fresh interpreter.
fn register_host_api(lua: &Lua, plugin: &str, host_fns: &Arc<HostFunctions>) -> mlua::Result<()> {
    let api = lua.create_table()?;

    {
        let fns = host_fns.clone();
        let plugin = plugin.to_string();
        api.set(
            "log",
            lua.create_function(
                move |lua, (level, message, fields): (Option<String>, String, Option<Table>)| {
                    let fields = match fields {
                        Some(t) => lua.from_value(Value::Table(t))?,
                        None => serde_json::Value::Null,
                    };
                    fns.log(&plugin, parse_level(level.as_deref()), &message, &fields);
                    Ok(())
                },
            )?,
        )?;
    }

    {
        let fns = host_fns.clone();
        api.set(
            "new_request_id",
            lua.create_function(move |_, ()| Ok(fns.new_request_id()))?,
        )?;
    }

    {
        let fns = host_fns.clone();
        let plugin = plugin.to_string();
        api.set(
            "kv_get",
            lua.create_function(move |lua, key: String| {
                match fns.kv_get(&plugin, &key) {
                    Ok(Some(value)) => Ok((Value::String(lua.create_string(&value)?), None)),
                    Ok(None) => Ok((Value::Nil, None)),
                    Err(e) => Ok((Value::Nil, Some(e.to_string()))),
                }
            })?,
        )?;
    }

    {
        let fns = host_fns.clone();
        let plugin = plugin.to_string();
        api.set(
            "kv_set",
            lua.create_function(move |_, (key, value): (String, String)| {
                match fns.kv_set(&plugin, &key, &value) {
                    Ok(()) => Ok((Value::Boolean(true), None)),
                    Err(e) => Ok((Value::Nil, Some(e.to_string()))),
                }
            })?,
        )?;
    }

    {
        let fns = host_fns.clone();
        let plugin = plugin.to_string();
        api.set(
            "kv_delete",
            lua.create_function(move |_, key: String| match fns.kv_delete(&plugin, &key) {
                Ok(()) => Ok((Value::Boolean(true), None)),
                Err(e) => Ok((Value::Nil, Some(e.to_string()))),
            })?,
        )?;
    }

    {
        let fns = host_fns.clone();
        let plugin = plugin.to_string();
        api.set(
            "emit_event",
            lua.create_function(
                move |_, (stream, event_type, payload): (String, String, Option<String>)| {
                    match fns.emit_event(
                        &plugin,
                        &stream,
                        &event_type,
                        payload.as_deref().unwrap_or_default(),
                    ) {
                        Ok(()) => Ok((Value::Boolean(true), None)),
                        Err(e) => Ok((Value::Nil, Some(e.to_string()))),
                    }
                },
            )?,
        )?;
    }

    {
        let fns = host_fns.clone();
        let plugin = plugin.to_string();
        api.set(
            "query_room",
            lua.create_function(move |lua, id: String| {
                lua_result(lua, fns.query_room(&plugin, &id))
            })?,
        )?;
    }

    {
        let fns = host_fns.clone();
        let plugin = plugin.to_string();
        api.set(
            "query_character",
            lua.create_function(move |lua, id: String| {
                lua_result(lua, fns.query_character(&plugin, &id))
            })?,
        )?;
    }

    {
        let fns = host_fns.clone();
        let plugin = plugin.to_string();
        api.set(
            "query_room_characters",
            lua.create_function(move |lua, id: String| {
                lua_result(lua, fns.query_room_characters(&plugin, &id))
            })?,
        )?;
    }

    {
        let fns = host_fns.clone();
        api.set(
            "list_commands",
            lua.create_function(move |lua, ()| lua_result(lua, fns.list_commands()))?,
        )?;
    }

    {
        let fns = host_fns.clone();
        api.set(
            "search_commands",
            lua.create_function(move |lua, query: String| {
                lua_result(lua, fns.search_commands(&query))
            })?,
        )?;
    }

    {
        let fns = host_fns.clone();
        api.set(
            "get_command",
            lua.create_function(move |lua, name: String| {
                lua_result(lua, fns.get_command(&name))
            })?,
        )?;
    }

    lua.globals().set("holomush", api)
}

#[cfg(test)]
mod tests {
    use super::*;
    use holomush_core::ActorKind;

    fn say_event(payload: &str) -> Event {
        Event {
            id: 1,
            stream: "location:123".into(),
            event_type: "say".into(),
            timestamp: 1_700_000_000_000,
            actor_kind: ActorKind::Character,
            actor_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            payload: payload.into(),
        }
    }

    fn bare_host_fns() -> Arc<HostFunctions> {
        Arc::new(HostFunctions::builder().build(Arc::new(CapabilityEnforcer::new())))
    }

    #[test]
    fn sandbox_has_no_ambient_authority() {
        let lua = build_sandbox().unwrap();
        let globals = lua.globals();
        for absent in ["io", "os", "debug", "package", "require", "load", "loadfile", "loadstring", "dofile"] {
            let value: Value = globals.get(absent).unwrap();
            assert!(value.is_nil(), "expected '{absent}' to be absent");
        }
        // The allowed libraries are present.
        for present in ["table", "string", "math", "pairs", "tostring"] {
            let value: Value = globals.get(present).unwrap();
            assert!(!value.is_nil(), "expected '{present}' to be present");
        }
    }

    #[test]
    fn run_delivery_returns_handler_emits() {
        let source = r#"
            function on_event(ev)
                return {{stream = ev.stream, type = "say", payload = ev.payload}}
            end
        "#;
        let (emits, violations) =
            run_delivery("t", source, &bare_host_fns(), &say_event("{}")).unwrap();
        assert!(violations.is_empty());
        assert_eq!(emits, vec![EmitEvent::new("location:123", "say", "{}")]);
    }

    #[test]
    fn nil_return_yields_no_emits() {
        let source = "function on_event(ev) return nil end";
        let (emits, violations) =
            run_delivery("t", source, &bare_host_fns(), &say_event("{}")).unwrap();
        assert!(emits.is_empty());
        assert!(violations.is_empty());
    }

    #[test]
    fn missing_handlers_yield_no_emits() {
        let (emits, violations) =
            run_delivery("t", "x = 1", &bare_host_fns(), &say_event("{}")).unwrap();
        assert!(emits.is_empty());
        assert!(violations.is_empty());
    }

    #[test]
    fn non_table_return_is_a_violation() {
        let source = "function on_event(ev) return 42 end";
        let (emits, violations) =
            run_delivery("t", source, &bare_host_fns(), &say_event("{}")).unwrap();
        assert!(emits.is_empty());
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn invalid_entries_are_skipped_but_valid_ones_flow() {
        let source = r#"
            function on_event(ev)
                return {
                    {stream = "location:1", type = "say", payload = "a"},
                    {stream = "", type = "say"},
                    "not a table",
                    {stream = "location:1", type = "pose"},
                }
            end
        "#;
        let (emits, violations) =
            run_delivery("t", source, &bare_host_fns(), &say_event("{}")).unwrap();
        assert_eq!(emits.len(), 2);
        assert_eq!(violations.len(), 2);
        assert_eq!(emits[1].event_type, "pose");
    }

    #[test]
    fn handler_errors_propagate() {
        let source = r#"function on_event(ev) error("kaput") end"#;
        let err = run_delivery("t", source, &bare_host_fns(), &say_event("{}")).unwrap_err();
        match err {
            DeliveryError::Handler(reason) => assert!(reason.contains("kaput")),
            DeliveryError::Init(reason) => panic!("unexpected init error: {reason}"),
        }
    }

    #[test]
    fn command_events_prefer_on_command() {
        let source = r#"
            function on_command(ctx)
                return {{stream = "character:" .. ctx.character_id, type = "ack", payload = ctx.name}}
            end
            function on_event(ev)
                return {{stream = "location:1", type = "wrong"}}
            end
        "#;
        let mut event = say_event(
            r#"{"name":"wave","args":"","character_id":"01ARZ3NDEKTSV4RRFFQ69G5FAV"}"#,
        );
        event.event_type = "command".into();
        let (emits, _) = run_delivery("t", source, &bare_host_fns(), &event).unwrap();
        assert_eq!(emits.len(), 1);
        assert_eq!(emits[0].event_type, "ack");
        assert_eq!(emits[0].payload, "wave");
    }

    #[test]
    fn command_events_fall_back_to_on_event() {
        let source = r#"
            function on_event(ev)
                return {{stream = ev.stream, type = ev.type}}
            end
        "#;
        let mut event = say_event(r#"{"name":"wave"}"#);
        event.event_type = "command".into();
        let (emits, _) = run_delivery("t", source, &bare_host_fns(), &event).unwrap();
        assert_eq!(emits[0].event_type, "command");
    }

    #[test]
    fn deliveries_do_not_share_interpreter_state() {
        // The counter global would grow across deliveries if state leaked.
        let source = r#"
            counter = (counter or 0) + 1
            function on_event(ev)
                return {{stream = "location:1", type = "count", payload = tostring(counter)}}
            end
        "#;
        for _ in 0..3 {
            let (emits, _) =
                run_delivery("t", source, &bare_host_fns(), &say_event("{}")).unwrap();
            assert_eq!(emits[0].payload, "1");
        }
    }

    #[tokio::test]
    async fn load_rejects_wrong_plugin_type() {
        let host = ScriptHost::new(bare_host_fns(), Arc::new(CapabilityEnforcer::new()));
        let manifest = Manifest::parse(
            b"name: b\nversion: 1.0.0\ntype: binary\nbinary-config:\n  executable: x\n",
        )
        .unwrap();
        let err = host.load(manifest, Path::new("/nonexistent")).await.unwrap_err();
        assert!(matches!(err, HostError::BadManifest(_)));
    }

    #[tokio::test]
    async fn closed_host_rejects_everything() {
        let host = ScriptHost::new(bare_host_fns(), Arc::new(CapabilityEnforcer::new()));
        host.close().await.unwrap();
        host.close().await.unwrap();

        let manifest = Manifest::parse(
            b"name: echo\nversion: 1.0.0\ntype: script\nscript-config:\n  entry: main.lua\n",
        )
        .unwrap();
        assert!(matches!(
            host.load(manifest, Path::new(".")).await,
            Err(HostError::Closed)
        ));
        assert!(matches!(host.unload("echo").await, Err(HostError::Closed)));
        assert!(matches!(
            host.deliver("echo", &say_event("{}")).await,
            Err(HostError::Closed)
        ));
    }
}

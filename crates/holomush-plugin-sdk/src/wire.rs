//! Shared protocol definitions between the host and plugin processes.
//!
//! Frames are newline-delimited JSON over the child's stdio. All traffic is
//! preceded by a versioned handshake: the host opens with
//! [`HostFrame::Handshake`] carrying the magic cookie pair and protocol
//! version, and the plugin answers with [`PluginFrame::Handshake`] or
//! refuses to speak.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use holomush_core::{ActorKind, EmitEvent, Event};

/// Environment-independent cookie key sent in the handshake.
pub const MAGIC_COOKIE_KEY: &str = "HOLOMUSH_PLUGIN_COOKIE";

/// Expected cookie value. A stable constant, not a secret: its only job is
/// to stop unrelated processes from being driven as plugins by accident.
pub const MAGIC_COOKIE_VALUE: &str = "craft-profound-fate-d41a2b";

/// Wire protocol version. Bump on any incompatible frame change.
pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Wire records
// ============================================================================

/// Log severity carried on `log` host calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Level not set by the caller.
    #[default]
    Unspecified,
    /// Debug severity.
    Debug,
    /// Informational severity.
    Info,
    /// Warning severity.
    Warn,
    /// Error severity.
    Error,
}

/// An event as it travels to the plugin process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Monotonic event identifier.
    pub id: u64,
    /// Origin stream address.
    pub stream: String,
    /// Event type string.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Actor classification as its canonical string.
    pub actor_kind: String,
    /// Identifier of the causing entity.
    #[serde(default)]
    pub actor_id: String,
    /// Opaque JSON payload.
    #[serde(default)]
    pub payload: String,
}

/// An emit record as it travels back from the plugin process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEmitEvent {
    /// Target stream address.
    pub stream: String,
    /// Event type string.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque JSON payload; may be empty.
    #[serde(default)]
    pub payload: String,
}

/// A host-function invocation made by the plugin during event handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum HostCall {
    /// Side-channel emit, in addition to the handler return value.
    EmitEvent {
        /// Target stream address.
        stream: String,
        /// Event type string.
        #[serde(rename = "type")]
        event_type: String,
        /// Opaque JSON payload.
        #[serde(default)]
        payload: String,
    },
    /// Structured log record tagged with the plugin name by the host.
    Log {
        /// Severity.
        #[serde(default)]
        level: LogLevel,
        /// Message text.
        message: String,
        /// Structured fields.
        #[serde(default)]
        fields: Value,
    },
    /// Mint a fresh request identifier.
    NewRequestId,
    /// Read a key from the plugin's namespaced store.
    KvGet {
        /// Key within the plugin namespace.
        key: String,
    },
    /// Write a key in the plugin's namespaced store.
    KvSet {
        /// Key within the plugin namespace.
        key: String,
        /// Value to store.
        value: String,
    },
    /// Delete a key from the plugin's namespaced store.
    KvDelete {
        /// Key within the plugin namespace.
        key: String,
    },
    /// Look up a room record.
    QueryRoom {
        /// Room identifier.
        id: String,
    },
    /// Look up a character record.
    QueryCharacter {
        /// Character identifier.
        id: String,
    },
    /// List the characters present in a room.
    QueryRoomCharacters {
        /// Room identifier.
        id: String,
    },
    /// List registered commands.
    ListCommands,
    /// Search registered commands.
    SearchCommands {
        /// Case-insensitive query.
        query: String,
    },
    /// Fetch a single command by name.
    GetCommand {
        /// Command name.
        name: String,
    },
}

// ============================================================================
// Frames
// ============================================================================

/// Host → plugin frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    /// Opening handshake; precedes all other traffic.
    Handshake {
        /// Must equal [`MAGIC_COOKIE_KEY`].
        magic_key: String,
        /// Must equal [`MAGIC_COOKIE_VALUE`].
        magic_value: String,
        /// Host's wire protocol version.
        protocol_version: u32,
    },
    /// Deliver one event to the plugin's handler.
    Request {
        /// Correlates the eventual [`PluginFrame::Response`].
        id: u64,
        /// The event being delivered.
        event: WireEvent,
    },
    /// Outcome of a [`PluginFrame::HostCall`].
    HostResult {
        /// Correlates with the originating host call.
        id: u64,
        /// Call result on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<Value>,
        /// Error message on failure (including capability denials).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<String>,
    },
}

/// Plugin → host frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginFrame {
    /// Handshake acknowledgement.
    Handshake {
        /// Plugin's wire protocol version.
        protocol_version: u32,
    },
    /// Outcome of a [`HostFrame::Request`].
    Response {
        /// Correlates with the originating request.
        id: u64,
        /// Emits produced by the handler; empty when the handler produced
        /// none or failed.
        #[serde(default)]
        emit_events: Vec<WireEmitEvent>,
        /// Handler error message, when handling failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A host-function invocation made while handling an event.
    HostCall {
        /// Correlates the eventual [`HostFrame::HostResult`].
        id: u64,
        /// The invocation itself.
        call: HostCall,
    },
}

// ============================================================================
// Adapter
// ============================================================================

/// Maps a core event onto the wire.
pub fn encode_event(event: &Event) -> WireEvent {
    WireEvent {
        id: event.id,
        stream: event.stream.clone(),
        event_type: event.event_type.clone(),
        timestamp: event.timestamp,
        actor_kind: event.actor_kind.as_str().to_string(),
        actor_id: event.actor_id.clone(),
        payload: event.payload.clone(),
    }
}

/// Maps a wire event back into the core record.
///
/// Unknown `actor_kind` strings decode to [`ActorKind::Character`] — the
/// overwhelmingly common case — so that a newer host can add kinds without
/// breaking older plugins. The raw string is still on the frame for callers
/// that want to be stricter.
pub fn decode_event(wire: WireEvent) -> Event {
    Event {
        id: wire.id,
        stream: wire.stream,
        event_type: wire.event_type,
        timestamp: wire.timestamp,
        actor_kind: ActorKind::parse(&wire.actor_kind).unwrap_or(ActorKind::Character),
        actor_id: wire.actor_id,
        payload: wire.payload,
    }
}

/// Maps a core emit onto the wire.
pub fn encode_emit(emit: &EmitEvent) -> WireEmitEvent {
    WireEmitEvent {
        stream: emit.stream.clone(),
        event_type: emit.event_type.clone(),
        payload: emit.payload.clone(),
    }
}

/// Maps a wire emit back into the core record.
pub fn decode_emit(wire: WireEmitEvent) -> EmitEvent {
    EmitEvent {
        stream: wire.stream,
        event_type: wire.event_type,
        payload: wire.payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(kind: ActorKind) -> Event {
        Event {
            id: 42,
            stream: "location:123".into(),
            event_type: "say".into(),
            timestamp: 1_700_000_000_000,
            actor_kind: kind,
            actor_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            payload: r#"{"message":"Hello"}"#.into(),
        }
    }

    #[test]
    fn event_round_trips_for_all_actor_kinds() {
        for kind in [
            ActorKind::Character,
            ActorKind::System,
            ActorKind::Plugin,
            ActorKind::Unknown,
        ] {
            let event = sample_event(kind);
            assert_eq!(decode_event(encode_event(&event)), event);
        }
    }

    #[test]
    fn unknown_actor_kind_decodes_to_character() {
        let mut wire = encode_event(&sample_event(ActorKind::System));
        wire.actor_kind = "automaton".into();
        assert_eq!(decode_event(wire).actor_kind, ActorKind::Character);
    }

    #[test]
    fn emit_round_trips() {
        let emit = EmitEvent::new("location:123", "say", r#"{"message":"Echo"}"#);
        assert_eq!(decode_emit(encode_emit(&emit)), emit);
    }

    #[test]
    fn response_frame_tolerates_missing_emit_list() {
        let frame: PluginFrame = serde_json::from_str(r#"{"type":"response","id":7}"#).unwrap();
        match frame {
            PluginFrame::Response {
                id,
                emit_events,
                error,
            } => {
                assert_eq!(id, 7);
                assert!(emit_events.is_empty());
                assert!(error.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn host_call_uses_fn_tag() {
        let json = serde_json::to_string(&HostCall::KvGet { key: "notes".into() }).unwrap();
        assert_eq!(json, r#"{"fn":"kv_get","key":"notes"}"#);
    }
}

//! Event types flowing from the server into plugins.
//!
//! This module provides the core event record and its classification:
//!
//! - [`Event`] - Immutable record handed to plugin handlers
//! - [`ActorKind`] - Who caused the event (character, system, plugin)
//! - [`stream_scope`] - The address family of a stream (`location:123` → `location`)

use serde::{Deserialize, Serialize};

// ============================================================================
// Actor Classification
// ============================================================================

/// Classification of the entity that caused an event.
///
/// This is used by plugins to distinguish player activity from machine
/// activity — most notably to avoid reacting to events they emitted
/// themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    /// A player character acting in the world.
    Character,
    /// The server itself (scheduled effects, world ticks, etc.).
    System,
    /// Another plugin, via an emitted event.
    Plugin,
    /// Origin could not be determined.
    Unknown,
}

impl ActorKind {
    /// Returns the canonical lowercase string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::Character => "character",
            ActorKind::System => "system",
            ActorKind::Plugin => "plugin",
            ActorKind::Unknown => "unknown",
        }
    }

    /// Parses a canonical string back into a kind.
    ///
    /// Returns `None` for anything that is not one of the four canonical
    /// values; callers decide their own fallback policy.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "character" => Some(ActorKind::Character),
            "system" => Some(ActorKind::System),
            "plugin" => Some(ActorKind::Plugin),
            "unknown" => Some(ActorKind::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Event
// ============================================================================

/// An immutable record of something that happened in the world.
///
/// Events enter the plugin subsystem from the server's event streams and are
/// delivered to subscribed plugins. The `payload` is an opaque JSON string
/// whose shape depends on `event_type`; plugins parse what they understand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic event identifier assigned by the originating stream.
    pub id: u64,
    /// Colon-prefixed origin address, e.g. `location:<id>` or `character:<id>`.
    pub stream: String,
    /// Event type string, e.g. `say`, `pose`, `arrive`, `command`.
    pub event_type: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Who caused the event.
    pub actor_kind: ActorKind,
    /// Identifier of the causing entity; empty when not applicable.
    pub actor_id: String,
    /// Opaque JSON payload.
    pub payload: String,
}

/// Event type used for command invocations.
pub const COMMAND_EVENT_TYPE: &str = "command";

impl Event {
    /// Whether this event carries a command invocation payload.
    pub fn is_command(&self) -> bool {
        self.event_type == COMMAND_EVENT_TYPE
    }
}

/// Returns the address family of a stream: the segment before the first `:`.
///
/// `stream_scope("location:123")` is `"location"`; a stream without a colon
/// is its own scope.
pub fn stream_scope(stream: &str) -> &str {
    stream.split(':').next().unwrap_or(stream)
}

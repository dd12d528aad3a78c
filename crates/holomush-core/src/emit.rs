//! Events produced by plugins on their way back into the world.

use serde::{Deserialize, Serialize};

use crate::error::{EmitError, EmitValidationError};

/// A record a plugin hands back to be published.
///
/// Produced either as a handler return value or through the `emit_event`
/// host function. Validation is deliberately minimal: the subsystem only
/// requires a target stream and a type; payload semantics belong to the
/// consumers of the target stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmitEvent {
    /// Target stream address.
    pub stream: String,
    /// Event type string.
    pub event_type: String,
    /// Opaque JSON payload; may be empty.
    pub payload: String,
}

impl EmitEvent {
    /// Creates an emit record.
    pub fn new(
        stream: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }

    /// Checks the required fields.
    ///
    /// An emit failing validation is dropped with a logged warning; it never
    /// fails the delivery that produced it.
    pub fn validate(&self) -> Result<(), EmitValidationError> {
        if self.stream.is_empty() {
            return Err(EmitValidationError::MissingField { field: "stream" });
        }
        if self.event_type.is_empty() {
            return Err(EmitValidationError::MissingField { field: "type" });
        }
        Ok(())
    }
}

/// Narrow interface through which accepted plugin emits leave the subsystem.
///
/// The dispatcher and the `emit_event` host function both publish through
/// this trait; the server wires in its own implementation. Keeping the
/// surface to one method avoids a reference cycle between the dispatcher
/// and the host-function layer.
pub trait PluginEventEmitter: Send + Sync {
    /// Publishes one emit on behalf of `plugin`.
    fn emit_plugin_event(&self, plugin: &str, emit: &EmitEvent) -> Result<(), EmitError>;
}

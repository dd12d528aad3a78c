//! Command invocation context.
//!
//! When a player types a command, the server publishes an event of type
//! `"command"` whose payload is the serialized invocation. Plugins that
//! implement commands receive the decoded [`CommandContext`] instead of the
//! raw event.

use serde::{Deserialize, Serialize};

use crate::error::CommandContextError;
use crate::event::Event;
use crate::id::is_ulid_shaped;

/// Decoded invocation of an in-world command.
///
/// Identifier fields (`character_id`, `location_id`, `player_id`) are either
/// empty — meaning "not applicable", e.g. a command issued from the system
/// console — or ULID strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandContext {
    /// Command name, e.g. `say` or `pose`.
    pub name: String,
    /// Raw argument string following the command name.
    pub args: String,
    /// The literal prefix or alias that led here, e.g. `:` vs `;`.
    pub invoked_as: String,
    /// Display name of the invoking character.
    pub character_name: String,
    /// Identifier of the invoking character.
    pub character_id: String,
    /// Identifier of the character's current location.
    pub location_id: String,
    /// Identifier of the player account behind the character.
    pub player_id: String,
}

impl CommandContext {
    /// Decodes the payload of a `"command"` event.
    ///
    /// Unknown payload fields are ignored; missing fields default to empty.
    /// Identifier shape is not enforced here — callers that require ULID
    /// identifiers use [`check_identifiers`](Self::check_identifiers).
    pub fn from_event(event: &Event) -> Result<Self, CommandContextError> {
        serde_json::from_str(&event.payload).map_err(|e| CommandContextError::BadPayload {
            reason: e.to_string(),
        })
    }

    /// Checks that every identifier field is empty or ULID-shaped.
    pub fn check_identifiers(&self) -> Result<(), CommandContextError> {
        for (field, value) in [
            ("character_id", &self.character_id),
            ("location_id", &self.location_id),
            ("player_id", &self.player_id),
        ] {
            if !value.is_empty() && !is_ulid_shaped(value) {
                return Err(CommandContextError::BadIdentifier {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ActorKind;

    fn command_event(payload: &str) -> Event {
        Event {
            id: 1,
            stream: "location:01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            event_type: "command".into(),
            timestamp: 1_700_000_000_000,
            actor_kind: ActorKind::Character,
            actor_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            payload: payload.into(),
        }
    }

    #[test]
    fn decodes_full_payload() {
        let ev = command_event(
            r#"{"name":"say","args":"hello","invoked_as":"\"",
               "character_name":"Alice",
               "character_id":"01ARZ3NDEKTSV4RRFFQ69G5FAV",
               "location_id":"01BX5ZZKBKACTAV9WEVGEMMVRZ"}"#,
        );
        let ctx = CommandContext::from_event(&ev).unwrap();
        assert_eq!(ctx.name, "say");
        assert_eq!(ctx.args, "hello");
        assert_eq!(ctx.character_name, "Alice");
        assert_eq!(ctx.player_id, "");
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let ctx = CommandContext::from_event(&command_event(r#"{"name":"look"}"#)).unwrap();
        assert_eq!(ctx.name, "look");
        assert_eq!(ctx.args, "");
        assert_eq!(ctx.location_id, "");
    }

    #[test]
    fn identifier_check_flags_malformed_ids() {
        let ctx = CommandContext::from_event(&command_event(
            r#"{"name":"say","character_id":"not-a-ulid!"}"#,
        ))
        .unwrap();
        let err = ctx.check_identifiers().unwrap_err();
        assert!(matches!(
            err,
            CommandContextError::BadIdentifier { field: "character_id", .. }
        ));

        // Loose server-side handles pass through decoding untouched.
        let ctx = CommandContext::from_event(&command_event(
            r#"{"name":"say","location_id":"loc456"}"#,
        ))
        .unwrap();
        assert_eq!(ctx.location_id, "loc456");
    }

    #[test]
    fn rejects_non_json_payload() {
        assert!(CommandContext::from_event(&command_event("not json")).is_err());
    }
}

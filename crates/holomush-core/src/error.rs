//! Unified error types for the core domain layer.
//!
//! Errors owned by higher layers (manifest validation, host lifecycle) live
//! next to those layers; this module holds the errors attached to the core
//! records themselves.

use thiserror::Error;

/// A plugin-produced emit failed validation.
///
/// These are accumulated and logged by the host that collected the emit;
/// the offending entry is dropped and the delivery continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmitValidationError {
    /// A required field was empty.
    #[error("emit event is missing required field '{field}'")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// The handler returned something that is not an emit record.
    #[error("emit entry has wrong shape: {reason}")]
    BadShape {
        /// What was wrong with the entry.
        reason: String,
    },
}

/// Publishing an accepted emit to the outside world failed.
#[derive(Debug, Clone, Error)]
#[error("failed to publish emit: {0}")]
pub struct EmitError(pub String);

/// A `"command"` event payload could not be parsed into a command context.
#[derive(Debug, Clone, Error)]
pub enum CommandContextError {
    /// The payload was not valid JSON of the expected shape.
    #[error("invalid command payload: {reason}")]
    BadPayload {
        /// Decoder message.
        reason: String,
    },

    /// An identifier field was neither empty nor ULID-shaped.
    #[error("field '{field}' is not a valid identifier: {value}")]
    BadIdentifier {
        /// Offending field name.
        field: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Result type for emit publication.
pub type EmitResult = Result<(), EmitError>;

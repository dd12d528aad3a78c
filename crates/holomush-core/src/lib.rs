//! # HoloMUSH Core
//!
//! Domain types shared across the HoloMUSH plugin subsystem.
//!
//! This crate is deliberately small: it holds the records that cross every
//! boundary of the plugin plane and nothing else.
//!
//! - **Events**: [`Event`], [`ActorKind`] — what the server hands to plugins
//! - **Emits**: [`EmitEvent`], [`PluginEventEmitter`] — what plugins hand back
//! - **Commands**: [`CommandContext`] — decoded command invocations
//! - **Identifiers**: ULID minting and shape checks
//!
//! The plugin hosts, the manager, and the dispatcher live in
//! `holomush-plugin`; the wire protocol and the plugin-author SDK live in
//! `holomush-plugin-sdk`.

pub mod command;
pub mod emit;
pub mod error;
pub mod event;
pub mod id;

pub use command::CommandContext;
pub use emit::{EmitEvent, PluginEventEmitter};
pub use error::{CommandContextError, EmitError, EmitResult, EmitValidationError};
pub use event::{ActorKind, COMMAND_EVENT_TYPE, Event, stream_scope};
pub use id::{is_ulid_shaped, new_request_id};

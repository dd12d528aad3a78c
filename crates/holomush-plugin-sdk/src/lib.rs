//! # HoloMUSH Plugin SDK
//!
//! Shared wire protocol and author runtime for HoloMUSH binary plugins.
//!
//! The crate has two halves:
//!
//! - [`wire`] - frame definitions exchanged between the host and plugin
//!   processes, the versioned handshake constants, and the adapter between
//!   wire records and `holomush-core` types.
//! - [`serve`](serve()) - a small runtime plugin authors embed in their
//!   binaries: implement [`Handler`], build a [`ServeConfig`], hand both to
//!   [`serve`](serve()), and the SDK drives the stdio connection.
//!
//! The host side of the protocol lives in `holomush-plugin`; plugin binaries
//! only ever need this crate (plus `holomush-core` for the record types).

pub mod serve;
pub mod wire;

pub use serve::{BoxError, Handler, HostCallError, HostHandle, ServeConfig, ServeError, serve};
pub use wire::{
    HostCall, HostFrame, LogLevel, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PROTOCOL_VERSION,
    PluginFrame, WireEmitEvent, WireEvent, decode_emit, decode_event, encode_emit, encode_event,
};

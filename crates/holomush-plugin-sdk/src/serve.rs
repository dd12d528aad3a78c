//! Minimal runtime for authoring HoloMUSH binary plugins.
//!
//! A plugin binary constructs a [`ServeConfig`] with its [`Handler`] and
//! calls [`serve`], which owns the process's stdio for the rest of its life:
//!
//! ```rust,ignore
//! use holomush_plugin_sdk::{serve, Handler, HostHandle, ServeConfig};
//! use holomush_core::{EmitEvent, Event};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn handle_event(
//!         &self,
//!         event: Event,
//!         _host: &HostHandle,
//!     ) -> Result<Vec<EmitEvent>, holomush_plugin_sdk::BoxError> {
//!         Ok(vec![EmitEvent::new(event.stream, "say", event.payload)])
//!     }
//! }
//!
//! fn main() {
//!     serve(ServeConfig::new().with_handler(Echo));
//! }
//! ```
//!
//! The loop is single-threaded: events are handled one at a time, and host
//! calls made during handling interleave on the same connection. Requests
//! that arrive while a host call is awaiting its result are queued and
//! handled next.

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use holomush_core::{EmitEvent, Event};

use crate::wire::{
    HostCall, HostFrame, LogLevel, MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PROTOCOL_VERSION,
    PluginFrame, WireEvent, decode_event, encode_emit,
};

/// Boxed error type returned by plugin handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Plugins implement this trait to receive events.
///
/// The handler runs to completion for each delivered event and returns the
/// emits it wants published. Host functions are reachable through the
/// [`HostHandle`] for the duration of the call.
pub trait Handler: Send + Sync {
    /// Handles one event delivery.
    fn handle_event(&self, event: Event, host: &HostHandle) -> Result<Vec<EmitEvent>, BoxError>;
}

/// Configuration for [`serve`].
#[derive(Default)]
pub struct ServeConfig {
    handler: Option<Arc<dyn Handler>>,
}

impl ServeConfig {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the event handler.
    pub fn with_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }
}

/// Errors that end a serve loop.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The host's opening handshake was absent or did not match.
    #[error("handshake failed: {reason}")]
    Handshake {
        /// What did not match.
        reason: String,
    },

    /// The connection broke.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced to the plugin from a host-function call.
#[derive(Debug, Error)]
pub enum HostCallError {
    /// The host reported an error, including capability denials.
    #[error("{0}")]
    Remote(String),

    /// The host returned a value of an unexpected shape.
    #[error("unexpected host result shape: {0}")]
    BadValue(String),

    /// The connection to the host closed mid-call.
    #[error("host disconnected")]
    Disconnected,

    /// The connection broke.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ============================================================================
// Connection
// ============================================================================

struct Connection {
    reader: Mutex<Box<dyn BufRead + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    /// Requests that arrived while a host call was awaiting its result.
    queued: Mutex<VecDeque<(u64, WireEvent)>>,
    next_call_id: AtomicU64,
}

impl Connection {
    fn new(reader: Box<dyn BufRead + Send>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            queued: Mutex::new(VecDeque::new()),
            next_call_id: AtomicU64::new(1),
        }
    }

    fn write_frame(&self, frame: &PluginFrame) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let line = serde_json::to_string(frame).map_err(io::Error::other)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    /// Reads the next well-formed frame, skipping blank and malformed lines.
    /// Returns `None` at end of stream.
    fn next_frame(&self) -> io::Result<Option<HostFrame>> {
        let mut reader = self.reader.lock().unwrap_or_else(|e| e.into_inner());
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<HostFrame>(trimmed) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => warn!(error = %e, "skipping malformed host frame"),
            }
        }
    }
}

// ============================================================================
// HostHandle
// ============================================================================

/// Client handle for host functions, valid for the life of the connection.
pub struct HostHandle {
    conn: Arc<Connection>,
}

impl HostHandle {
    fn call(&self, call: HostCall) -> Result<Value, HostCallError> {
        let id = self.conn.next_call_id.fetch_add(1, Ordering::Relaxed);
        self.conn.write_frame(&PluginFrame::HostCall { id, call })?;

        loop {
            match self.conn.next_frame()? {
                None => return Err(HostCallError::Disconnected),
                Some(HostFrame::HostResult { id: rid, ok, err }) if rid == id => {
                    return match err {
                        Some(message) => Err(HostCallError::Remote(message)),
                        None => Ok(ok.unwrap_or(Value::Null)),
                    };
                }
                Some(HostFrame::HostResult { id: rid, .. }) => {
                    warn!(id = rid, "dropping host result for unknown call");
                }
                Some(HostFrame::Request { id, event }) => {
                    self.conn
                        .queued
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_back((id, event));
                }
                Some(HostFrame::Handshake { .. }) => {
                    warn!("dropping unexpected mid-session handshake");
                }
            }
        }
    }

    /// Emits a structured log record tagged with this plugin's name.
    pub fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        fields: Value,
    ) -> Result<(), HostCallError> {
        self.call(HostCall::Log {
            level,
            message: message.into(),
            fields,
        })
        .map(|_| ())
    }

    /// Mints a fresh request identifier.
    pub fn new_request_id(&self) -> Result<String, HostCallError> {
        match self.call(HostCall::NewRequestId)? {
            Value::String(id) => Ok(id),
            other => Err(HostCallError::BadValue(other.to_string())),
        }
    }

    /// Reads a key from the plugin's namespaced store.
    pub fn kv_get(&self, key: impl Into<String>) -> Result<Option<String>, HostCallError> {
        match self.call(HostCall::KvGet { key: key.into() })? {
            Value::Null => Ok(None),
            Value::String(value) => Ok(Some(value)),
            other => Err(HostCallError::BadValue(other.to_string())),
        }
    }

    /// Writes a key in the plugin's namespaced store.
    pub fn kv_set(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), HostCallError> {
        self.call(HostCall::KvSet {
            key: key.into(),
            value: value.into(),
        })
        .map(|_| ())
    }

    /// Deletes a key from the plugin's namespaced store.
    pub fn kv_delete(&self, key: impl Into<String>) -> Result<(), HostCallError> {
        self.call(HostCall::KvDelete { key: key.into() }).map(|_| ())
    }

    /// Publishes a side-channel emit, in addition to the handler return.
    pub fn emit_event(
        &self,
        stream: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), HostCallError> {
        self.call(HostCall::EmitEvent {
            stream: stream.into(),
            event_type: event_type.into(),
            payload: payload.into(),
        })
        .map(|_| ())
    }

    /// Looks up a room record.
    pub fn query_room(&self, id: impl Into<String>) -> Result<Value, HostCallError> {
        self.call(HostCall::QueryRoom { id: id.into() })
    }

    /// Looks up a character record.
    pub fn query_character(&self, id: impl Into<String>) -> Result<Value, HostCallError> {
        self.call(HostCall::QueryCharacter { id: id.into() })
    }

    /// Lists the characters present in a room.
    pub fn query_room_characters(&self, id: impl Into<String>) -> Result<Value, HostCallError> {
        self.call(HostCall::QueryRoomCharacters { id: id.into() })
    }

    /// Lists registered commands.
    pub fn list_commands(&self) -> Result<Value, HostCallError> {
        self.call(HostCall::ListCommands)
    }

    /// Searches registered commands.
    pub fn search_commands(&self, query: impl Into<String>) -> Result<Value, HostCallError> {
        self.call(HostCall::SearchCommands {
            query: query.into(),
        })
    }

    /// Fetches a single command by name.
    pub fn get_command(&self, name: impl Into<String>) -> Result<Value, HostCallError> {
        self.call(HostCall::GetCommand { name: name.into() })
    }
}

// ============================================================================
// Serve loop
// ============================================================================

/// Runs the plugin event loop over the process's stdio and never returns.
///
/// # Panics
///
/// Panics when `config` has no handler.
pub fn serve(config: ServeConfig) -> ! {
    let handler = config
        .handler
        .expect("ServeConfig without a handler; call with_handler before serve");

    let stdin = io::stdin();
    let reader: Box<dyn BufRead + Send> = Box::new(io::BufReader::new(stdin));
    let writer: Box<dyn Write + Send> = Box::new(io::stdout());

    match run(reader, writer, handler) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("plugin terminating: {e}");
            std::process::exit(1);
        }
    }
}

/// Drives one connection to completion. Split out of [`serve`] so tests can
/// run the loop over in-memory buffers.
pub(crate) fn run(
    reader: Box<dyn BufRead + Send>,
    writer: Box<dyn Write + Send>,
    handler: Arc<dyn Handler>,
) -> Result<(), ServeError> {
    let conn = Arc::new(Connection::new(reader, writer));

    // Handshake gates all other traffic.
    match conn.next_frame()? {
        Some(HostFrame::Handshake {
            magic_key,
            magic_value,
            protocol_version,
        }) => {
            if magic_key != MAGIC_COOKIE_KEY || magic_value != MAGIC_COOKIE_VALUE {
                return Err(ServeError::Handshake {
                    reason: "magic cookie mismatch".into(),
                });
            }
            if protocol_version != PROTOCOL_VERSION {
                return Err(ServeError::Handshake {
                    reason: format!(
                        "protocol version mismatch: host {protocol_version}, plugin {PROTOCOL_VERSION}"
                    ),
                });
            }
        }
        Some(_) => {
            return Err(ServeError::Handshake {
                reason: "first frame was not a handshake".into(),
            });
        }
        None => {
            return Err(ServeError::Handshake {
                reason: "connection closed before handshake".into(),
            });
        }
    }
    conn.write_frame(&PluginFrame::Handshake {
        protocol_version: PROTOCOL_VERSION,
    })?;

    let host = HostHandle { conn: conn.clone() };

    loop {
        // Prefer requests queued during a host call.
        let queued = conn
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let (id, event) = match queued {
            Some(item) => item,
            None => match conn.next_frame()? {
                Some(HostFrame::Request { id, event }) => (id, event),
                Some(HostFrame::HostResult { id, .. }) => {
                    warn!(id, "dropping host result with no call in flight");
                    continue;
                }
                Some(HostFrame::Handshake { .. }) => {
                    warn!("dropping unexpected mid-session handshake");
                    continue;
                }
                None => return Ok(()),
            },
        };

        let response = match handler.handle_event(decode_event(event), &host) {
            Ok(emits) => PluginFrame::Response {
                id,
                emit_events: emits.iter().map(encode_emit).collect(),
                error: None,
            },
            Err(e) => PluginFrame::Response {
                id,
                emit_events: Vec::new(),
                error: Some(e.to_string()),
            },
        };
        conn.write_frame(&response)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Echo;

    impl Handler for Echo {
        fn handle_event(
            &self,
            event: Event,
            _host: &HostHandle,
        ) -> Result<Vec<EmitEvent>, BoxError> {
            Ok(vec![EmitEvent::new(event.stream, "say", event.payload)])
        }
    }

    struct KvReader;

    impl Handler for KvReader {
        fn handle_event(
            &self,
            _event: Event,
            host: &HostHandle,
        ) -> Result<Vec<EmitEvent>, BoxError> {
            let value = host.kv_get("greeting")?.unwrap_or_default();
            Ok(vec![EmitEvent::new("location:1", "say", value)])
        }
    }

    fn handshake_line() -> String {
        serde_json::to_string(&HostFrame::Handshake {
            magic_key: MAGIC_COOKIE_KEY.into(),
            magic_value: MAGIC_COOKIE_VALUE.into(),
            protocol_version: PROTOCOL_VERSION,
        })
        .unwrap()
    }

    fn request_line(id: u64) -> String {
        serde_json::to_string(&HostFrame::Request {
            id,
            event: WireEvent {
                id: 9,
                stream: "location:1".into(),
                event_type: "say".into(),
                timestamp: 0,
                actor_kind: "character".into(),
                actor_id: String::new(),
                payload: r#"{"message":"hi"}"#.into(),
            },
        })
        .unwrap()
    }

    fn run_session(input: String, handler: Arc<dyn Handler>) -> (Vec<PluginFrame>, bool) {
        let output = Arc::new(Mutex::new(Vec::<u8>::new()));

        struct SharedWriter(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedWriter {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let result = run(
            Box::new(Cursor::new(input)),
            Box::new(SharedWriter(output.clone())),
            handler,
        );
        let bytes = output.lock().unwrap().clone();
        let frames = String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<PluginFrame>(l).unwrap())
            .collect();
        (frames, result.is_ok())
    }

    #[test]
    fn answers_requests_after_handshake() {
        let input = format!("{}\n{}\n", handshake_line(), request_line(3));
        let (frames, ok) = run_session(input, Arc::new(Echo));
        assert!(ok);
        assert!(matches!(
            frames[0],
            PluginFrame::Handshake {
                protocol_version: PROTOCOL_VERSION
            }
        ));
        match &frames[1] {
            PluginFrame::Response {
                id,
                emit_events,
                error,
            } => {
                assert_eq!(*id, 3);
                assert_eq!(emit_events.len(), 1);
                assert_eq!(emit_events[0].stream, "location:1");
                assert!(error.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn refuses_bad_cookie() {
        let bad = serde_json::to_string(&HostFrame::Handshake {
            magic_key: MAGIC_COOKIE_KEY.into(),
            magic_value: "wrong".into(),
            protocol_version: PROTOCOL_VERSION,
        })
        .unwrap();
        let (frames, ok) = run_session(format!("{bad}\n"), Arc::new(Echo));
        assert!(!ok);
        assert!(frames.is_empty());
    }

    #[test]
    fn refuses_version_mismatch() {
        let bad = serde_json::to_string(&HostFrame::Handshake {
            magic_key: MAGIC_COOKIE_KEY.into(),
            magic_value: MAGIC_COOKIE_VALUE.into(),
            protocol_version: PROTOCOL_VERSION + 1,
        })
        .unwrap();
        let (frames, ok) = run_session(format!("{bad}\n"), Arc::new(Echo));
        assert!(!ok);
        assert!(frames.is_empty());
    }

    #[test]
    fn host_calls_interleave_with_the_read_loop() {
        // The first host call issued by the plugin gets id 1; the canned
        // input answers it right after the request frame.
        let host_result = serde_json::to_string(&HostFrame::HostResult {
            id: 1,
            ok: Some(Value::String("salve".into())),
            err: None,
        })
        .unwrap();
        let input = format!("{}\n{}\n{}\n", handshake_line(), request_line(5), host_result);
        let (frames, ok) = run_session(input, Arc::new(KvReader));
        assert!(ok);
        match &frames[1] {
            PluginFrame::HostCall { id, call } => {
                assert_eq!(*id, 1);
                assert_eq!(
                    call,
                    &HostCall::KvGet {
                        key: "greeting".into()
                    }
                );
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        match &frames[2] {
            PluginFrame::Response { emit_events, .. } => {
                assert_eq!(emit_events[0].payload, "salve");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn handler_error_becomes_response_error() {
        struct Failing;
        impl Handler for Failing {
            fn handle_event(
                &self,
                _event: Event,
                _host: &HostHandle,
            ) -> Result<Vec<EmitEvent>, BoxError> {
                Err("boom".into())
            }
        }
        let input = format!("{}\n{}\n", handshake_line(), request_line(1));
        let (frames, ok) = run_session(input, Arc::new(Failing));
        assert!(ok);
        match &frames[1] {
            PluginFrame::Response {
                emit_events, error, ..
            } => {
                assert!(emit_events.is_empty());
                assert_eq!(error.as_deref(), Some("boom"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

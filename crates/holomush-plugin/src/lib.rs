//! # HoloMUSH Plugin Subsystem
//!
//! The plugin host plane of the HoloMUSH server: third-party extensions —
//! sandboxed scripts or supervised native binaries — react to in-world
//! events and implement commands, while the server keeps authority over
//! security, resource lifetime, and ordering.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   events    ┌─────────────────┐   deliver   ┌─────────────┐
//! │   Server   │────────────▶│ EventSubscriber │────────────▶│ PluginHost  │
//! │  streams   │             │  (dispatch)     │             │ script/bin  │
//! └────────────┘             └─────────────────┘             └──────┬──────┘
//!       ▲                            │ emits                        │
//!       └──────── PluginEventEmitter ┘          HostFunctions ◀─────┘
//! ```
//!
//! - [`manifest`] — bundle metadata: parsing, validation, JSON Schema
//! - [`capability`] — glob capability grants, deny by default
//! - [`host`] — the [`PluginHost`] contract both runtimes implement
//! - [`script`] — per-event sandboxed Lua interpreter host
//! - [`binary`] — supervised subprocess host over the SDK wire protocol
//! - [`manager`] — discovery and type-dispatched aggregate lifecycle
//! - [`subscriber`] — stream-event routing and emit collection
//! - [`hostfn`] — the capability-gated surface plugins call back through
//!
//! Capability checks live inside host functions, never in the event path;
//! an event delivery only touches the enforcer when the plugin asks for
//! something privileged.

pub mod binary;
pub mod capability;
pub mod host;
pub mod hostfn;
pub mod manager;
pub mod manifest;
pub mod schema;
pub mod script;
pub mod subscriber;

pub use binary::{
    BinaryHost, ClientError, ClientFactory, DEFAULT_CALL_TIMEOUT, LaunchError, PluginClient,
    SubprocessFactory, resolve_executable,
};
pub use capability::{CapabilityEnforcer, CapabilityError, CapabilityResult};
pub use host::{HostError, HostResult, PluginHost};
pub use hostfn::{
    CommandInfo, CommandRegistry, HostFnError, HostFnResult, HostFunctions, HostFunctionsBuilder,
    KvStore, ServiceError, WorldQuery,
};
pub use manager::{DiscoveredPlugin, MANIFEST_FILE, PluginManager};
pub use manifest::{
    BinaryConfig, CommandSpec, Manifest, ManifestError, PluginType, ScriptConfig,
};
pub use schema::{SCHEMA_ID, generate_schema, validate_against_schema};
pub use script::ScriptHost;
pub use subscriber::{EventSubscriber, SubscriberPhase};

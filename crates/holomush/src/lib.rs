//! # HoloMUSH
//!
//! Facade over the plugin subsystem of the HoloMUSH virtual-world server.
//!
//! A minimal embedding wires the pieces together like this:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use holomush::prelude::*;
//!
//! # async fn run(emitter: Arc<dyn PluginEventEmitter>) {
//! let config = holomush::runtime::config::load_config().unwrap_or_default();
//! let enforcer = Arc::new(CapabilityEnforcer::new());
//! let host_fns = Arc::new(HostFunctions::builder().emitter(emitter.clone()).build(enforcer.clone()));
//!
//! let script = Arc::new(ScriptHost::new(host_fns.clone(), enforcer.clone()));
//! let binary = Arc::new(BinaryHost::new(host_fns, enforcer));
//!
//! let mut manager = PluginManager::new();
//! manager.register_host(script.clone());
//! manager.register_host(binary);
//!
//! let discovered = manager.discover(&config.plugins.dir).await;
//! manager.load_all(discovered).await;
//!
//! let subscriber = EventSubscriber::new(emitter);
//! subscriber.subscribe("echo", "location:*", ["say".to_string()], script);
//! # }
//! ```

pub use holomush_core as core;
pub use holomush_plugin as plugin;
pub use holomush_plugin_sdk as sdk;
pub use holomush_runtime as runtime;

/// Common imports for embedders.
pub mod prelude {
    pub use holomush_core::{
        ActorKind, CommandContext, EmitEvent, Event, PluginEventEmitter, new_request_id,
    };
    pub use holomush_plugin::{
        BinaryHost, CapabilityEnforcer, EventSubscriber, HostError, HostFunctions, Manifest,
        PluginHost, PluginManager, PluginType, ScriptHost,
    };
    pub use holomush_runtime::config::HoloConfig;
}

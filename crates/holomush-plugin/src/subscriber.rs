//! Event subscription and dispatch.
//!
//! [`EventSubscriber`] routes stream events to subscribed plugins. A single
//! worker drains the incoming channel; each matching (plugin, subscription)
//! pair gets its own tracked delivery task, so a slow or failing plugin
//! never blocks delivery to its peers.
//!
//! ```text
//! Created ──► Running ──► Stopping ──► Stopped
//! ```
//!
//! Delivery and emitter errors are logged, never propagated: the event
//! stream must survive any single plugin. Ordering is guaranteed only per
//! (plugin, stream) in dequeue order; emits from one delivery reach the
//! emitter in the order the plugin produced them.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Level, debug, span, warn};

use holomush_core::{Event, PluginEventEmitter};

use crate::capability::segment_glob;
use crate::host::PluginHost;

/// One routing entry: deliver events on matching streams to one plugin.
struct Subscription {
    plugin: String,
    /// Stream pattern over `:` segments; `location:*` matches every
    /// location stream, a literal matches exactly.
    stream_pattern: String,
    /// Event types to deliver; empty means all.
    event_types: HashSet<String>,
    host: Arc<dyn PluginHost>,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        segment_glob(&self.stream_pattern, &event.stream, ':')
    }
}

/// Lifecycle phase of the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberPhase {
    /// Built, not yet started.
    Created,
    /// Worker running.
    Running,
    /// Stop requested, joining in-flight work.
    Stopping,
    /// Fully stopped.
    Stopped,
}

/// Routes stream events to matching plugins and forwards their emits.
pub struct EventSubscriber {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    emitter: Arc<dyn PluginEventEmitter>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    worker: Mutex<Option<JoinHandle<()>>>,
    phase: Mutex<SubscriberPhase>,
}

impl EventSubscriber {
    /// Creates a subscriber that publishes accepted emits through `emitter`.
    pub fn new(emitter: Arc<dyn PluginEventEmitter>) -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            emitter,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            worker: Mutex::new(None),
            phase: Mutex::new(SubscriberPhase::Created),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SubscriberPhase {
        *self.phase.lock()
    }

    /// Appends a subscription: deliver events on streams matching
    /// `stream_pattern` (and whose type is in `event_types`, empty meaning
    /// all) to `plugin` via `host`.
    pub fn subscribe(
        &self,
        plugin: impl Into<String>,
        stream_pattern: impl Into<String>,
        event_types: impl IntoIterator<Item = String>,
        host: Arc<dyn PluginHost>,
    ) {
        let subscription = Subscription {
            plugin: plugin.into(),
            stream_pattern: stream_pattern.into(),
            event_types: event_types.into_iter().collect(),
            host,
        };
        debug!(
            plugin = %subscription.plugin,
            stream = %subscription.stream_pattern,
            "subscription added"
        );
        self.subscriptions.write().push(subscription);
    }

    /// Number of registered subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Spawns the worker over `events`. Starting twice is a no-op.
    pub fn start(&self, mut events: mpsc::Receiver<Event>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("subscriber already started");
            return;
        }
        *self.phase.lock() = SubscriberPhase::Running;

        let subscriptions = Arc::clone(&self.subscriptions);
        let emitter = Arc::clone(&self.emitter);
        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();

        *worker = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => match received {
                        None => break,
                        Some(event) => {
                            dispatch(&subscriptions, &emitter, &tracker, event);
                        }
                    },
                }
            }
        }));
    }

    /// Stops the worker and blocks until every in-flight delivery finishes.
    pub async fn stop(&self) {
        *self.phase.lock() = SubscriberPhase::Stopping;
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            warn!(error = %e, "subscriber worker ended abnormally");
        }
        self.tracker.close();
        self.tracker.wait().await;
        *self.phase.lock() = SubscriberPhase::Stopped;
    }
}

/// Fans one event out to every matching subscription.
fn dispatch(
    subscriptions: &Arc<RwLock<Vec<Subscription>>>,
    emitter: &Arc<dyn PluginEventEmitter>,
    tracker: &TaskTracker,
    event: Event,
) {
    // Snapshot matches under the read lock; deliveries run outside it.
    let matches: Vec<(String, Arc<dyn PluginHost>)> = {
        let subscriptions = subscriptions.read();
        subscriptions
            .iter()
            .filter(|s| s.matches(&event))
            .map(|s| (s.plugin.clone(), Arc::clone(&s.host)))
            .collect()
    };
    if matches.is_empty() {
        return;
    }

    let event = Arc::new(event);
    for (plugin, host) in matches {
        let event = Arc::clone(&event);
        let emitter = Arc::clone(emitter);
        tracker.spawn(async move {
            let span = span!(
                Level::DEBUG,
                "deliver",
                plugin = %plugin,
                stream = %event.stream,
                event_type = %event.event_type
            );
            let _enter = span.enter();

            match host.deliver(&plugin, &event).await {
                Ok(emits) => {
                    for emit in emits {
                        if let Err(e) = emitter.emit_plugin_event(&plugin, &emit) {
                            warn!(plugin = %plugin, error = %e, "emitter rejected plugin emit");
                        }
                    }
                }
                Err(e) => {
                    warn!(plugin = %plugin, error = %e, "delivery failed");
                }
            }
        });
    }
}

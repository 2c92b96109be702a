//! Event manager: subscription lifecycle, queueing and per-event workers.
//!
//! While enabled, every notification from the source is turned into an
//! [`Event`], queued (subject to masks) and handed to a freshly spawned
//! worker thread that runs the registered handler. A slow handler never
//! stalls the subscription.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{EventError, EventResult};
use crate::event::{Action, Attributes, Event};
use crate::queue::{EventQueue, MaskHandle};
use crate::source::{RawEventSink, UeventSource};
use crate::sync::MonitorSwitch;

const EVENT_LOG: &str = "blockwatch::event";

/// Main event handler, run once per queued event on its own worker.
pub type Handler = Arc<dyn Fn() + Send + Sync>;

/// Post-handler callback, given the event that spawned the worker.
pub type NotifyCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Lifecycle state of an [`EventManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Not subscribed; notifications are not delivered.
    Disabled,
    /// Subscribed and dispatching.
    Enabled,
}

#[derive(Default, Clone)]
struct Callbacks {
    handler: Option<Handler>,
    notify: Option<NotifyCallback>,
}

struct Shared {
    queue: EventQueue,
    callbacks: RwLock<Callbacks>,
    monitor: MonitorSwitch,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn handle_raw(&self, attributes: Attributes) {
        if !self.monitor.is_enabled() {
            return;
        }

        let event = Event::from_attributes(attributes);
        debug!(target: EVENT_LOG, "-> {}", event);
        if !self.queue.enqueue(event.clone()) {
            return;
        }

        let Callbacks { handler, notify } = self.callbacks.read().clone();
        let Some(handler) = handler else {
            return;
        };

        let spawned = thread::Builder::new()
            .name(format!("event-{}", event.id()))
            .spawn(move || {
                handler();
                if let Some(notify) = notify {
                    notify(&event);
                }
            });
        match spawned {
            Ok(handle) => {
                let mut workers = self.workers.lock();
                workers.retain(|w| !w.is_finished());
                workers.push(handle);
            }
            Err(e) => warn!("failed to spawn event worker: {}", e),
        }
    }
}

/// Owns the notification subscription and the event queue.
pub struct EventManager {
    shared: Arc<Shared>,
    source: Mutex<Box<dyn UeventSource>>,
    state: Mutex<ManagerState>,
}

impl EventManager {
    /// Create a disabled manager over `source`. `monitor` is switched on by
    /// [`enable`](Self::enable) and off by [`disable`](Self::disable).
    pub fn new(source: Box<dyn UeventSource>, monitor: MonitorSwitch) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: EventQueue::new(),
                callbacks: RwLock::new(Callbacks::default()),
                monitor,
                workers: Mutex::new(Vec::new()),
            }),
            source: Mutex::new(source),
            state: Mutex::new(ManagerState::Disabled),
        }
    }

    /// Register the main handler.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.callbacks.write().handler = Some(Arc::new(handler));
    }

    /// Register a callback that runs on the worker after the handler returns.
    pub fn set_notify<F>(&self, notify: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().notify = Some(Arc::new(notify));
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    /// Returns true while subscribed.
    pub fn is_enabled(&self) -> bool {
        self.state() == ManagerState::Enabled
    }

    /// The monitoring switch shared with synchronizers.
    pub fn monitor(&self) -> &MonitorSwitch {
        &self.shared.monitor
    }

    /// Subscribe to the source and start dispatching.
    ///
    /// Fails with [`EventError::NotConfigured`] if no handler is registered.
    pub fn enable(&self) -> EventResult<()> {
        let mut state = self.state.lock();
        if *state == ManagerState::Enabled {
            return Ok(());
        }
        if self.shared.callbacks.read().handler.is_none() {
            return Err(EventError::NotConfigured(
                "cannot enable handler with no callback".to_string(),
            ));
        }

        info!(target: EVENT_LOG, "enabling event handling");
        let shared = Arc::clone(&self.shared);
        let sink: RawEventSink = Arc::new(move |attrs| shared.handle_raw(attrs));

        self.shared.monitor.set(true);
        if let Err(e) = self.source.lock().subscribe(sink) {
            self.shared.monitor.set(false);
            return Err(e);
        }
        *state = ManagerState::Enabled;
        Ok(())
    }

    /// Unsubscribe, drop pending events and switch monitoring off.
    /// Calling this while disabled is harmless.
    pub fn disable(&self) {
        let mut state = self.state.lock();
        info!(target: EVENT_LOG, "disabling event handling");
        self.source.lock().unsubscribe();
        self.shared.queue.clear();
        self.shared.monitor.set(false);
        *state = ManagerState::Disabled;
    }

    /// Returns true if the underlying source is subscribed.
    pub fn is_subscribed(&self) -> bool {
        self.source.lock().is_active()
    }

    /// Suppress future events; `None` matches any device or action.
    pub fn mask_add(&self, device: Option<&str>, action: Option<Action>) -> MaskHandle {
        self.shared.queue.mask_add(device, action)
    }

    /// Remove a mask added by [`mask_add`](Self::mask_add).
    pub fn mask_remove(&self, handle: MaskHandle) {
        self.shared.queue.mask_remove(handle)
    }

    /// Dequeue the oldest pending event.
    pub fn next_event(&self) -> EventResult<Event> {
        self.shared.queue.dequeue()
    }

    /// Number of events waiting to be handled.
    pub fn events_pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Snapshot of the pending events, oldest first.
    pub fn pending_events(&self) -> Vec<Event> {
        self.shared.queue.pending()
    }

    /// Block until every worker spawned so far has finished.
    pub fn join_workers(&self) {
        loop {
            let batch: Vec<JoinHandle<()>> = self.shared.workers.lock().drain(..).collect();
            if batch.is_empty() {
                return;
            }
            for worker in batch {
                if worker.join().is_err() {
                    warn!("event worker panicked");
                }
            }
        }
    }
}

impl Drop for EventManager {
    fn drop(&mut self) {
        self.source.get_mut().unsubscribe();
    }
}

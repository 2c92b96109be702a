//! The live monitoring pipeline: source, manager, dispatcher and model.

use std::sync::Arc;

use blockwatch_core::{
    DeviceProbe, EventManager, InMemoryTree, MonitorSwitch, ReconciliationDispatcher, SharedLock,
    SyncContext, UeventSource,
};
use parking_lot::Mutex;
use tracing::info;

use crate::config::DaemonConfig;
use crate::control::ControlSurface;
use crate::error::MgmtResult;

/// A fully wired event pipeline over an in-memory model.
pub struct Monitor {
    lock: SharedLock<InMemoryTree>,
    manager: Arc<EventManager>,
    dispatcher: Arc<ReconciliationDispatcher<InMemoryTree>>,
    control: ControlSurface<InMemoryTree>,
    monitoring_enabled: bool,
}

impl Monitor {
    /// Wire `source` to a fresh model. Nothing is subscribed until [`start`](Self::start).
    pub fn new(
        config: &DaemonConfig,
        source: Box<dyn UeventSource>,
        probe: Arc<dyn DeviceProbe>,
    ) -> Self {
        let monitor = MonitorSwitch::new(false);
        let ctx = SyncContext::new(monitor.clone(), &config.sync);
        let lock = Arc::new(Mutex::new(InMemoryTree::new(ctx)));
        let manager = Arc::new(EventManager::new(source, monitor));
        let dispatcher = Arc::new(ReconciliationDispatcher::new(
            Arc::clone(&lock),
            Arc::clone(&probe),
            config.reconcile.clone(),
        ));
        dispatcher.attach(&manager);
        let control = ControlSurface::new(Arc::clone(&lock), probe);
        Self {
            lock,
            manager,
            dispatcher,
            control,
            monitoring_enabled: config.monitoring_enabled,
        }
    }

    /// Scan the system into the model, then subscribe if monitoring is on.
    pub fn start(&self) -> MgmtResult<()> {
        let devices = self.control.reset();
        info!("initial scan found {} devices", devices);
        if self.monitoring_enabled {
            self.manager.enable()?;
        } else {
            info!("event monitoring disabled by configuration");
        }
        Ok(())
    }

    /// Unsubscribe and wait for in-flight event workers.
    pub fn stop(&self) {
        self.manager.disable();
        self.manager.join_workers();
    }

    /// The shared model lock.
    pub fn lock(&self) -> &SharedLock<InMemoryTree> {
        &self.lock
    }

    /// The event manager.
    pub fn manager(&self) -> &Arc<EventManager> {
        &self.manager
    }

    /// The dispatcher handling queued events.
    pub fn dispatcher(&self) -> &Arc<ReconciliationDispatcher<InMemoryTree>> {
        &self.dispatcher
    }

    /// Reset / list / resolve over the live model.
    pub fn control(&self) -> &ControlSurface<InMemoryTree> {
        &self.control
    }
}

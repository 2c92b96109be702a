//! Shared harness for end-to-end event pipeline tests.

#![allow(dead_code)]

use std::sync::Arc;

use blockwatch_core::{
    Attributes, ChannelSender, ChannelSource, Device, DeviceId, DeviceKind, DeviceProbe,
    EventManager, FixedProbe, Format, InMemoryTree, MonitorSwitch, ReconcileConfig,
    ReconciliationDispatcher, SharedLock, SyncConfig, SyncContext,
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// An enabled manager wired to a dispatcher over an in-memory tree.
pub struct Pipeline {
    pub lock: SharedLock<InMemoryTree>,
    pub manager: Arc<EventManager>,
    pub dispatcher: Arc<ReconciliationDispatcher<InMemoryTree>>,
    pub sender: ChannelSender,
    pub probe: Arc<FixedProbe>,
    pub ctx: SyncContext,
}

impl Pipeline {
    pub fn new() -> Self {
        init_tracing();
        let monitor = MonitorSwitch::new(false);
        let ctx = SyncContext::new(
            monitor.clone(),
            &SyncConfig {
                ready_poll_ms: 5,
                default_timeout_ms: None,
            },
        );
        let lock = Arc::new(Mutex::new(InMemoryTree::new(ctx.clone())));
        let source = ChannelSource::new();
        let sender = source.sender();
        let manager = Arc::new(EventManager::new(Box::new(source), monitor));
        let probe = Arc::new(FixedProbe::new());
        let dispatcher = Arc::new(ReconciliationDispatcher::new(
            Arc::clone(&lock),
            Arc::clone(&probe) as Arc<dyn DeviceProbe>,
            ReconcileConfig {
                handshake_timeout_ms: Some(5_000),
                ..ReconcileConfig::default()
            },
        ));
        dispatcher.attach(&manager);
        manager.enable().unwrap();
        Self {
            lock,
            manager,
            dispatcher,
            sender,
            probe,
            ctx,
        }
    }

    /// Insert a device with a node in the probe.
    pub fn add_device(&self, name: &str, kind: DeviceKind, format_type: &str, exists: bool) -> DeviceId {
        let mut device = Device::new(&self.ctx, name, kind);
        device.exists = exists;
        device.status = exists;
        device.format = Format::new(&self.ctx, format_type);
        self.probe.add_node(&device.path());
        self.lock.lock().insert(device)
    }

    /// Wait for every spawned event worker.
    pub fn settle(&self) {
        self.manager.join_workers();
    }
}

/// Route pipeline logs through the test harness; `RUST_LOG` selects them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Attributes of a udev-processed block uevent.
pub fn uevent(action: &str, devpath: &str, extra: &[(&str, &str)]) -> Attributes {
    let name = devpath.rsplit('/').next().unwrap_or_default();
    let mut attrs: Attributes = [
        ("ACTION", action.to_string()),
        ("DEVPATH", devpath.to_string()),
        ("DEVNAME", format!("/dev/{}", name)),
        ("SUBSYSTEM", "block".to_string()),
        ("USEC_INITIALIZED", "1000".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    for (k, v) in extra {
        attrs.insert(k.to_string(), v.to_string());
    }
    attrs
}

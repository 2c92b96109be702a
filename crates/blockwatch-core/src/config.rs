//! Tunables for the event pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Synchronizer timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval at which a dispatcher blocked in `wait_for_ready` re-checks the latch.
    pub ready_poll_ms: u64,
    /// Default controller-side confirmation timeout; `None` waits forever.
    pub default_timeout_ms: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ready_poll_ms: 100,
            default_timeout_ms: None,
        }
    }
}

impl SyncConfig {
    /// `ready_poll_ms` as a duration.
    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms.max(1))
    }

    /// `default_timeout_ms` as a duration.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Netlink multicast group to listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetlinkGroup {
    /// Raw kernel uevents (group 1), delivered before udev processing.
    Kernel,
    /// Events re-broadcast by udev (group 2), carrying the udev database properties.
    Udev,
}

impl NetlinkGroup {
    /// Multicast group bitmask for `nl_groups`.
    pub fn mask(&self) -> u32 {
        match self {
            NetlinkGroup::Kernel => 1,
            NetlinkGroup::Udev => 2,
        }
    }
}

/// Event manager / notification source settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Only events from this kernel subsystem are delivered.
    pub subsystem: String,
    /// Netlink group for the live source.
    pub netlink_group: NetlinkGroup,
    /// Requested socket receive buffer size in bytes.
    pub receive_buffer_bytes: usize,
    /// How often the source reader checks for shutdown.
    pub poll_interval_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            subsystem: "block".to_string(),
            netlink_group: NetlinkGroup::Udev,
            receive_buffer_bytes: 1024 * 1024,
            poll_interval_ms: 200,
        }
    }
}

/// Matching rules used by the reconciliation dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Names with these prefixes are transient helpers whose change events are ignored.
    pub transient_name_prefixes: Vec<String>,
    /// Event names with these prefixes may match a device by its sysfs basename.
    pub sysfs_alias_prefixes: Vec<String>,
    /// Devices with these name prefixes get no remove event on deactivation,
    /// so teardown is confirmed by add/change.
    pub silent_teardown_prefixes: Vec<String>,
    /// Upper bound for the dispatcher side of the handshake; `None` waits forever.
    pub handshake_timeout_ms: Option<u64>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            transient_name_prefixes: vec!["temporary-cryptsetup-".to_string()],
            sysfs_alias_prefixes: vec!["md".to_string()],
            silent_teardown_prefixes: vec!["loop".to_string()],
            handshake_timeout_ms: None,
        }
    }
}

impl ReconcileConfig {
    /// `handshake_timeout_ms` as a duration.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }
}

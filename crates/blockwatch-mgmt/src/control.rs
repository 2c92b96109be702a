//! Administrative operations on the device model.

use std::sync::Arc;

use blockwatch_core::{udev, Device, DeviceProbe, DeviceTree, SharedLock};
use serde::Serialize;
use tracing::info;

use crate::error::{MgmtError, MgmtResult};

/// What the CLI reports about one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    /// Device name.
    pub name: String,
    /// Node path.
    pub path: String,
    /// Device category.
    pub kind: String,
    /// Format type; empty for none.
    pub format: String,
    /// Format UUID.
    pub uuid: Option<String>,
    /// Format label.
    pub label: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// sysfs path; empty while inactive.
    pub sysfs_path: String,
}

impl DeviceSummary {
    fn of(device: &Device) -> Self {
        Self {
            name: device.name.clone(),
            path: device.path(),
            kind: format!("{:?}", device.kind),
            format: device.format.format_type.clone(),
            uuid: device.format.uuid.clone(),
            label: device.format.label.clone(),
            size: device.size,
            sysfs_path: device.sysfs_path.clone(),
        }
    }
}

/// Reset, listing and lookup over a shared device model.
pub struct ControlSurface<T: DeviceTree> {
    lock: SharedLock<T>,
    probe: Arc<dyn DeviceProbe>,
}

impl<T: DeviceTree> ControlSurface<T> {
    /// Control the model behind `lock`, rescanning through `probe`.
    pub fn new(lock: SharedLock<T>, probe: Arc<dyn DeviceProbe>) -> Self {
        Self { lock, probe }
    }

    /// Drop the model and rebuild it from the devices the system reports.
    /// Holds the shared lock throughout. Returns the number of devices added.
    pub fn reset(&self) -> usize {
        let devices = self.probe.block_devices();
        let mut tree = self.lock.lock();
        tree.clear();

        // partitions look up their disk by name, so disks go first
        let (partitions, wholes): (Vec<_>, Vec<_>) =
            devices.iter().partition(|d| udev::is_partition(d));
        let mut added = 0;
        for info in wholes.into_iter().chain(partitions) {
            if tree.insert_discovered(info).is_some() {
                added += 1;
            }
        }
        info!("model reset: {} devices", added);
        added
    }

    /// Names of every visible device, sorted.
    pub fn list_device_names(&self) -> Vec<String> {
        let tree = self.lock.lock();
        let mut names: Vec<String> = tree
            .devices()
            .into_iter()
            .filter_map(|id| tree.device(id).map(|d| d.name.clone()))
            .collect();
        names.sort();
        names
    }

    /// Summaries of every visible device, sorted by name.
    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        let tree = self.lock.lock();
        let mut devices: Vec<DeviceSummary> = tree
            .devices()
            .into_iter()
            .filter_map(|id| tree.device(id).map(DeviceSummary::of))
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }

    /// Resolve a device spec: `name`, `/dev/name`, `/dev/mapper/name`,
    /// `UUID=...` or `LABEL=...`.
    pub fn resolve_device(&self, spec: &str) -> MgmtResult<DeviceSummary> {
        let tree = self.lock.lock();
        let id = if let Some(uuid) = spec.strip_prefix("UUID=") {
            tree.find_by_uuid(uuid, false)
        } else if let Some(label) = spec.strip_prefix("LABEL=") {
            tree.find_by_label(label, false)
        } else {
            let name = spec
                .strip_prefix("/dev/mapper/")
                .or_else(|| spec.strip_prefix("/dev/"))
                .unwrap_or(spec);
            tree.find_by_name(name, false)
        };

        id.and_then(|id| tree.device(id))
            .map(DeviceSummary::of)
            .ok_or_else(|| MgmtError::NotFound(spec.to_string()))
    }
}

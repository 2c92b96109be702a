//! Live device state, read outside the model.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::event::Attributes;

const SECTOR_SIZE: u64 = 512;

/// Queries against the running system that the dispatcher needs while
/// reconciling.
pub trait DeviceProbe: Send + Sync {
    /// Returns true if the device node (e.g. `/dev/sda1`) exists.
    fn node_exists(&self, path: &str) -> bool;

    /// Current size in bytes of the device at `sysfs_path`, if readable.
    fn current_size(&self, sysfs_path: &str) -> Option<u64>;

    /// Attribute maps of every block device currently known to udev.
    fn block_devices(&self) -> Vec<Attributes>;
}

/// Probe reading sysfs, `/dev` and the udev database.
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    sys_root: PathBuf,
    dev_root: PathBuf,
    udev_data: PathBuf,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::with_roots("/sys", "/dev", "/run/udev/data")
    }
}

impl SysfsProbe {
    /// Probe the real system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe alternate roots, e.g. a captured tree under a temp dir.
    pub fn with_roots(
        sys_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
        udev_data: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sys_root: sys_root.into(),
            dev_root: dev_root.into(),
            udev_data: udev_data.into(),
        }
    }

    fn rebase(root: &Path, prefix: &str, path: &str) -> PathBuf {
        let rel = path.strip_prefix(prefix).unwrap_or(path);
        root.join(rel.trim_start_matches('/'))
    }

    fn read_device(&self, entry: &Path, name: &str) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("SUBSYSTEM".to_string(), "block".to_string());

        match fs::read_to_string(entry.join("uevent")) {
            Ok(text) => {
                for line in text.lines() {
                    if let Some((k, v)) = line.split_once('=') {
                        attrs.insert(k.to_string(), v.to_string());
                    }
                }
            }
            Err(e) => debug!("no uevent file for {}: {}", name, e),
        }

        let devname = attrs
            .get("DEVNAME")
            .cloned()
            .unwrap_or_else(|| name.to_string());
        if !devname.starts_with('/') {
            attrs.insert("DEVNAME".to_string(), format!("/dev/{}", devname));
        }

        let devpath = fs::read_link(entry)
            .ok()
            .and_then(|target| {
                let target = target.to_string_lossy().into_owned();
                target.find("/devices/").map(|at| target[at..].to_string())
            })
            .unwrap_or_else(|| format!("/class/block/{}", name));
        attrs.insert("DEVPATH".to_string(), devpath);

        let db_key = match (attrs.get("MAJOR"), attrs.get("MINOR")) {
            (Some(major), Some(minor)) => Some(format!("b{}:{}", major, minor)),
            _ => None,
        };
        if let Some(key) = db_key {
            if let Ok(text) = fs::read_to_string(self.udev_data.join(key)) {
                for line in text.lines() {
                    if let Some(prop) = line.strip_prefix("E:") {
                        if let Some((k, v)) = prop.split_once('=') {
                            attrs.insert(k.to_string(), v.to_string());
                        }
                    } else if let Some(usec) = line.strip_prefix("I:") {
                        attrs.insert("USEC_INITIALIZED".to_string(), usec.to_string());
                    }
                }
            }
        }
        attrs
    }
}

impl DeviceProbe for SysfsProbe {
    fn node_exists(&self, path: &str) -> bool {
        Self::rebase(&self.dev_root, "/dev", path).exists()
    }

    fn current_size(&self, sysfs_path: &str) -> Option<u64> {
        if sysfs_path.is_empty() {
            return None;
        }
        let size_file = Self::rebase(&self.sys_root, "/sys", sysfs_path).join("size");
        match fs::read_to_string(&size_file) {
            Ok(text) => text
                .trim()
                .parse::<u64>()
                .ok()
                .map(|sectors| sectors * SECTOR_SIZE),
            Err(e) => {
                debug!("cannot read {}: {}", size_file.display(), e);
                None
            }
        }
    }

    fn block_devices(&self) -> Vec<Attributes> {
        let class = self.sys_root.join("class/block");
        let entries = match fs::read_dir(&class) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("cannot list {}: {}", class.display(), e);
                return Vec::new();
            }
        };

        let mut names: Vec<(String, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
            .collect();
        names.sort();
        names
            .iter()
            .map(|(name, path)| self.read_device(path, name))
            .collect()
    }
}

/// Probe answering from fixed tables.
#[derive(Debug, Default)]
pub struct FixedProbe {
    nodes: RwLock<BTreeSet<String>>,
    sizes: RwLock<BTreeMap<String, u64>>,
    devices: RwLock<Vec<Attributes>>,
}

impl FixedProbe {
    /// An empty probe: no nodes, no sizes, no devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a device node as present.
    pub fn add_node(&self, path: &str) {
        self.nodes.write().insert(path.to_string());
    }

    /// Mark a device node as gone.
    pub fn remove_node(&self, path: &str) {
        self.nodes.write().remove(path);
    }

    /// Set the size reported for a sysfs path.
    pub fn set_size(&self, sysfs_path: &str, bytes: u64) {
        self.sizes.write().insert(sysfs_path.to_string(), bytes);
    }

    /// Replace the udev device list.
    pub fn set_block_devices(&self, devices: Vec<Attributes>) {
        *self.devices.write() = devices;
    }
}

impl DeviceProbe for FixedProbe {
    fn node_exists(&self, path: &str) -> bool {
        self.nodes.read().contains(path)
    }

    fn current_size(&self, sysfs_path: &str) -> Option<u64> {
        self.sizes.read().get(sysfs_path).copied()
    }

    fn block_devices(&self) -> Vec<Attributes> {
        self.devices.read().clone()
    }
}

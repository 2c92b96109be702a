//! The device model the dispatcher reconciles against.
//!
//! [`DeviceTree`] is the boundary the dispatcher talks to: lookups,
//! insertion of newly discovered devices, recursive removal and action
//! cancellation. [`InMemoryTree`] is an arena-backed implementation used by
//! the management front end and by tests.
//!
//! Every [`Device`] and [`Format`] owns its synchronizers. Cloning either
//! yields fresh, unarmed synchronizers; live wait state is never shared.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::event::Attributes;
use crate::sync::{SyncContext, SyncHandle};
use crate::udev;

/// Arena key of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Broad device category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Whole disk.
    Disk,
    /// Partition of a disk.
    Partition,
    /// Loop device.
    Loop,
    /// md RAID array.
    Md,
    /// Generic device-mapper device (crypt, multipath, ...).
    DeviceMapper,
    /// LVM logical volume.
    LogicalVolume,
    /// LVM volume group (no block node of its own).
    VolumeGroup,
}

impl DeviceKind {
    /// Returns true if this kind of device may carry a partition table.
    pub fn is_partitionable(&self) -> bool {
        matches!(self, DeviceKind::Disk | DeviceKind::Loop | DeviceKind::Md)
    }
}

/// Which of a device's synchronizers to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSlot {
    /// Guards create / destroy / resize.
    Modify,
    /// Guards setup / teardown / change.
    Control,
    /// Guards changes to the current format.
    Format,
    /// Guards changes to the format found on disk at scan time.
    OriginalFormat,
}

impl SyncSlot {
    /// Every slot, in lookup order.
    pub const ALL: [SyncSlot; 4] = [
        SyncSlot::Modify,
        SyncSlot::Control,
        SyncSlot::Format,
        SyncSlot::OriginalFormat,
    ];
}

/// LVM physical volume metadata as reported by the volume manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PvInfo {
    /// Name of the volume group this PV belongs to.
    pub vg_name: String,
    /// UUID of that volume group.
    pub vg_uuid: String,
    /// Offset of the first physical extent, in bytes.
    pub pe_start: u64,
}

const CONTAINER_MEMBER_TYPES: [&str; 3] = ["btrfs", "mdmember", "lvmpv"];
const UNLABELED_TYPES: [&str; 4] = ["disklabel", "lvmpv", "mdmember", "luks"];

/// On-disk format of a device.
#[derive(Debug)]
pub struct Format {
    /// Format type (`ext4`, `lvmpv`, `disklabel`, ...); empty for none.
    pub format_type: String,
    /// Format UUID (for container members: the member UUID).
    pub uuid: Option<String>,
    /// Filesystem label.
    pub label: Option<String>,
    /// Whether the format exists on disk.
    pub exists: bool,
    /// UUID of the container this device is a member of.
    pub container_uuid: Option<String>,
    /// Volume group name, for LVM physical volumes.
    pub vg_name: Option<String>,
    /// First extent offset, for LVM physical volumes.
    pub pe_start: Option<u64>,
    /// Cached mountpoint.
    pub mountpoint: Option<String>,
    /// Cached read-only mount state.
    pub mounted_read_only: bool,
    event_sync: SyncHandle,
}

impl Format {
    /// A format of the given type that does not exist yet.
    pub fn new(ctx: &SyncContext, format_type: &str) -> Self {
        Self {
            format_type: format_type.to_string(),
            uuid: None,
            label: None,
            exists: false,
            container_uuid: None,
            vg_name: None,
            pe_start: None,
            mountpoint: None,
            mounted_read_only: false,
            event_sync: ctx.single(),
        }
    }

    /// No format.
    pub fn none(ctx: &SyncContext) -> Self {
        Self::new(ctx, "")
    }

    /// Map a udev `ID_FS_TYPE` to a format type.
    pub fn type_from_udev(udev_type: Option<&str>) -> String {
        match udev_type {
            None => String::new(),
            Some("LVM2_member") => "lvmpv".to_string(),
            Some("linux_raid_member") => "mdmember".to_string(),
            Some("crypto_LUKS") => "luks".to_string(),
            Some(other) => other.to_string(),
        }
    }

    /// Build the format described by a uevent's attributes.
    pub fn from_udev(ctx: &SyncContext, info: &Attributes, partitionable: bool) -> Self {
        if partitionable && udev::part_table_type(info).is_some() {
            let mut format = Self::new(ctx, "disklabel");
            format.uuid = udev::disklabel_uuid(info).map(str::to_string);
            format.exists = true;
            return format;
        }

        let format_type = Self::type_from_udev(udev::format_type(info));
        let mut format = Self::new(ctx, &format_type);
        format.exists = !format_type.is_empty();
        format.label = udev::label(info).map(str::to_string);
        match format_type.as_str() {
            "btrfs" => {
                format.uuid = udev::sub_uuid(info).map(str::to_string);
                format.container_uuid = udev::uuid(info).map(str::to_string);
            }
            "mdmember" => {
                format.uuid = udev::md_device_uuid(info).map(str::to_string);
                format.container_uuid = udev::uuid(info).map(str::to_string);
            }
            _ => format.uuid = udev::uuid(info).map(str::to_string),
        }
        format
    }

    /// Returns true for formats that make the device a member of a container.
    pub fn is_container_member(&self) -> bool {
        CONTAINER_MEMBER_TYPES.contains(&self.format_type.as_str())
    }

    /// Returns true for formats that carry a label.
    pub fn supports_label(&self) -> bool {
        !self.format_type.is_empty() && !UNLABELED_TYPES.contains(&self.format_type.as_str())
    }

    /// Forget cached mount state.
    pub fn clear_mount_state(&mut self) {
        self.mountpoint = None;
        self.mounted_read_only = false;
    }

    /// Synchronizer guarding changes to this format.
    pub fn event_sync(&self) -> &SyncHandle {
        &self.event_sync
    }
}

impl Clone for Format {
    fn clone(&self) -> Self {
        Self {
            format_type: self.format_type.clone(),
            uuid: self.uuid.clone(),
            label: self.label.clone(),
            exists: self.exists,
            container_uuid: self.container_uuid.clone(),
            vg_name: self.vg_name.clone(),
            pe_start: self.pe_start,
            mountpoint: self.mountpoint.clone(),
            mounted_read_only: self.mounted_read_only,
            event_sync: self.event_sync.fresh_copy().into(),
        }
    }
}

/// A block device in the model.
#[derive(Debug)]
pub struct Device {
    /// Current name (basename of the node, or dm name).
    pub name: String,
    /// Device category.
    pub kind: DeviceKind,
    /// LV name, for logical volumes.
    pub lv_name: Option<String>,
    /// Absolute sysfs path; empty while inactive.
    pub sysfs_path: String,
    /// Device UUID (partition UUID, array UUID, VG UUID).
    pub uuid: Option<String>,
    /// Whether the device exists on the system.
    pub exists: bool,
    /// Whether the device is active.
    pub status: bool,
    /// Size in bytes.
    pub size: u64,
    /// Whether the device may carry a partition table.
    pub partitionable: bool,
    /// Logical partition inside an extended partition.
    pub logical: bool,
    /// Partition start, in sectors.
    pub part_start: Option<u64>,
    /// Devices this one is built on.
    pub parents: Vec<DeviceId>,
    /// Current format.
    pub format: Format,
    /// Format found on disk when the device was scanned.
    pub original_format: Format,
    modify_sync: SyncHandle,
    control_sync: SyncHandle,
}

impl Device {
    /// A non-existent device with no format.
    pub fn new(ctx: &SyncContext, name: &str, kind: DeviceKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            lv_name: None,
            sysfs_path: String::new(),
            uuid: None,
            exists: false,
            status: false,
            size: 0,
            partitionable: kind.is_partitionable(),
            logical: false,
            part_start: None,
            parents: Vec::new(),
            format: Format::none(ctx),
            original_format: Format::none(ctx),
            modify_sync: ctx.single(),
            control_sync: ctx.single(),
        }
    }

    /// Replace the control synchronizer with an aggregate over `members`,
    /// for containers whose changes surface on their members.
    pub fn with_control_group(mut self, ctx: &SyncContext, members: Vec<SyncHandle>) -> Self {
        self.control_sync = ctx.group(members);
        self
    }

    /// Device node path.
    pub fn path(&self) -> String {
        match self.kind {
            DeviceKind::DeviceMapper | DeviceKind::LogicalVolume => {
                format!("/dev/mapper/{}", self.name)
            }
            _ => format!("/dev/{}", self.name),
        }
    }

    /// Synchronizer guarding create / destroy / resize.
    pub fn modify_sync(&self) -> &SyncHandle {
        &self.modify_sync
    }

    /// Synchronizer guarding setup / teardown / change.
    pub fn control_sync(&self) -> &SyncHandle {
        &self.control_sync
    }

    /// Synchronizer in `slot`.
    pub fn sync(&self, slot: SyncSlot) -> &SyncHandle {
        match slot {
            SyncSlot::Modify => &self.modify_sync,
            SyncSlot::Control => &self.control_sync,
            SyncSlot::Format => self.format.event_sync(),
            SyncSlot::OriginalFormat => self.original_format.event_sync(),
        }
    }

    /// Returns true if any non-aggregate synchronizer awaits an event.
    pub fn awaiting_sync(&self) -> bool {
        SyncSlot::ALL.iter().any(|slot| {
            let sync = self.sync(*slot);
            !sync.is_aggregate() && sync.awaiting_sync()
        })
    }
}

impl Clone for Device {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind,
            lv_name: self.lv_name.clone(),
            sysfs_path: self.sysfs_path.clone(),
            uuid: self.uuid.clone(),
            exists: self.exists,
            status: self.status,
            size: self.size,
            partitionable: self.partitionable,
            logical: self.logical,
            part_start: self.part_start,
            parents: self.parents.clone(),
            format: self.format.clone(),
            original_format: self.original_format.clone(),
            modify_sync: self.modify_sync.fresh_copy().into(),
            control_sync: self.control_sync.fresh_copy().into(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} ({})", self.kind, self.name, self.path())
    }
}

/// The model operations the dispatcher relies on.
pub trait DeviceTree: Send {
    /// Look up a device record, including hidden and detached ones.
    fn device(&self, id: DeviceId) -> Option<&Device>;

    /// Mutable access to a device record.
    fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device>;

    /// Visible devices.
    fn devices(&self) -> Vec<DeviceId>;

    /// Devices referenced by pending actions, in or out of the tree.
    fn action_devices(&self) -> Vec<DeviceId>;

    /// Returns true while the action queue is being executed.
    fn actions_processing(&self) -> bool;

    /// Find a device by name.
    fn find_by_name(&self, name: &str, hidden: bool) -> Option<DeviceId>;

    /// Find a device by sysfs path.
    fn find_by_sysfs_path(&self, path: &str, hidden: bool) -> Option<DeviceId>;

    /// Find a device by device or format UUID.
    fn find_by_uuid(&self, uuid: &str, hidden: bool) -> Option<DeviceId>;

    /// Find a device by format label.
    fn find_by_label(&self, label: &str, hidden: bool) -> Option<DeviceId>;

    /// Devices built directly on `id`.
    fn children(&self, id: DeviceId) -> Vec<DeviceId>;

    /// The disks `id` ultimately lives on (a disk is its own disk).
    fn disks(&self, id: DeviceId) -> Vec<DeviceId> {
        let mut disks = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(device) = self.device(current) else {
                continue;
            };
            if device.parents.is_empty() {
                disks.push(current);
            } else {
                stack.extend(device.parents.iter().copied());
            }
        }
        disks
    }

    /// Add a device found from outside (a uevent or a rescan).
    fn insert_discovered(&mut self, info: &Attributes) -> Option<DeviceId>;

    /// Remove `id` and everything built on it. Registers no actions.
    fn recursive_remove(&mut self, id: DeviceId);

    /// Detach `parent` from `child`'s parents. Returns false if it was not one.
    fn remove_parent(&mut self, child: DeviceId, parent: DeviceId) -> bool;

    /// Drop pending actions touching any of `disks`.
    fn cancel_disk_actions(&mut self, disks: &[DeviceId]);

    /// Replace the format of `id` with the one described by `info`.
    fn detect_format(&mut self, id: DeviceId, info: &Attributes);

    /// Volume manager metadata for the PV at `path`.
    fn pv_info(&self, path: &str) -> Option<PvInfo>;

    /// Invalidate cached volume manager metadata.
    fn drop_lvm_cache(&mut self) {}

    /// Remove every device and action.
    fn clear(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Visible,
    Hidden,
    Detached,
}

#[derive(Debug)]
struct Slot {
    device: Device,
    placement: Placement,
}

/// A queued storage action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAction {
    /// Device the action operates on.
    pub device: DeviceId,
    /// Human-readable summary.
    pub description: String,
}

/// Arena-backed [`DeviceTree`].
pub struct InMemoryTree {
    ctx: SyncContext,
    arena: BTreeMap<DeviceId, Slot>,
    next_id: u64,
    actions: Vec<PendingAction>,
    processing: bool,
    pv_info: BTreeMap<String, PvInfo>,
    lvm_cache_generation: u64,
}

impl InMemoryTree {
    /// An empty tree whose devices get synchronizers from `ctx`.
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            arena: BTreeMap::new(),
            next_id: 0,
            actions: Vec::new(),
            processing: false,
            pv_info: BTreeMap::new(),
            lvm_cache_generation: 0,
        }
    }

    /// Synchronizer context for building devices.
    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Add a visible device.
    pub fn insert(&mut self, device: Device) -> DeviceId {
        self.insert_with(device, Placement::Visible)
    }

    /// Add a hidden device (found only by lookups that include hidden ones).
    pub fn insert_hidden(&mut self, device: Device) -> DeviceId {
        self.insert_with(device, Placement::Hidden)
    }

    fn insert_with(&mut self, device: Device, placement: Placement) -> DeviceId {
        let id = DeviceId(self.next_id);
        self.next_id += 1;
        debug!("adding {} as {}", device, id);
        self.arena.insert(id, Slot { device, placement });
        id
    }

    /// Queue an action on `device`.
    pub fn schedule_action(&mut self, device: DeviceId, description: &str) {
        self.actions.push(PendingAction {
            device,
            description: description.to_string(),
        });
    }

    /// Pending actions, in order.
    pub fn actions(&self) -> &[PendingAction] {
        &self.actions
    }

    /// Mark the action queue as executing or idle.
    pub fn set_processing(&mut self, processing: bool) {
        self.processing = processing;
    }

    /// Record volume manager metadata for the PV at `path`.
    pub fn set_pv_info(&mut self, path: &str, info: PvInfo) {
        self.pv_info.insert(path.to_string(), info);
    }

    /// How many times the LVM cache has been dropped.
    pub fn lvm_cache_generation(&self) -> u64 {
        self.lvm_cache_generation
    }

    /// Returns true if `id` is in the tree (visible or hidden).
    pub fn contains(&self, id: DeviceId) -> bool {
        self.arena
            .get(&id)
            .is_some_and(|s| s.placement != Placement::Detached)
    }

    fn find<P>(&self, hidden: bool, pred: P) -> Option<DeviceId>
    where
        P: Fn(&Device) -> bool,
    {
        self.arena
            .iter()
            .find(|(_, slot)| {
                let placed = match slot.placement {
                    Placement::Visible => true,
                    Placement::Hidden => hidden,
                    Placement::Detached => false,
                };
                placed && pred(&slot.device)
            })
            .map(|(id, _)| *id)
    }

    fn referenced_by_action(&self, id: DeviceId) -> bool {
        self.actions.iter().any(|a| a.device == id)
    }

    fn action_touches(&self, device: DeviceId, disks: &[DeviceId]) -> bool {
        disks.contains(&device) || self.disks(device).iter().any(|d| disks.contains(d))
    }
}

impl DeviceTree for InMemoryTree {
    fn device(&self, id: DeviceId) -> Option<&Device> {
        self.arena.get(&id).map(|s| &s.device)
    }

    fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.arena.get_mut(&id).map(|s| &mut s.device)
    }

    fn devices(&self) -> Vec<DeviceId> {
        self.arena
            .iter()
            .filter(|(_, s)| s.placement == Placement::Visible)
            .map(|(id, _)| *id)
            .collect()
    }

    fn action_devices(&self) -> Vec<DeviceId> {
        let mut seen = BTreeSet::new();
        self.actions
            .iter()
            .map(|a| a.device)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    fn actions_processing(&self) -> bool {
        self.processing
    }

    fn find_by_name(&self, name: &str, hidden: bool) -> Option<DeviceId> {
        self.find(hidden, |d| d.name == name)
    }

    fn find_by_sysfs_path(&self, path: &str, hidden: bool) -> Option<DeviceId> {
        if path.is_empty() {
            return None;
        }
        self.find(hidden, |d| d.sysfs_path == path)
    }

    fn find_by_uuid(&self, uuid: &str, hidden: bool) -> Option<DeviceId> {
        self.find(hidden, |d| {
            d.uuid.as_deref() == Some(uuid) || d.format.uuid.as_deref() == Some(uuid)
        })
    }

    fn find_by_label(&self, label: &str, hidden: bool) -> Option<DeviceId> {
        self.find(hidden, |d| d.format.label.as_deref() == Some(label))
    }

    fn children(&self, id: DeviceId) -> Vec<DeviceId> {
        self.arena
            .iter()
            .filter(|(_, s)| s.placement != Placement::Detached && s.device.parents.contains(&id))
            .map(|(child, _)| *child)
            .collect()
    }

    fn insert_discovered(&mut self, info: &Attributes) -> Option<DeviceId> {
        let name = udev::device_name(info);
        if name.is_empty() {
            return None;
        }
        if let Some(existing) = self.find_by_name(&name, true) {
            return Some(existing);
        }

        let kind = if udev::is_partition(info) {
            DeviceKind::Partition
        } else if udev::is_dm(info) {
            if udev::lv_name(info).is_some() {
                DeviceKind::LogicalVolume
            } else {
                DeviceKind::DeviceMapper
            }
        } else if udev::is_md(info) {
            DeviceKind::Md
        } else if name.starts_with("loop") {
            DeviceKind::Loop
        } else {
            DeviceKind::Disk
        };

        let mut device = Device::new(&self.ctx, &name, kind);
        device.exists = true;
        device.status = true;
        device.sysfs_path = udev::sysfs_path(info);
        device.lv_name = udev::lv_name(info).map(str::to_string);
        match kind {
            DeviceKind::Partition => {
                device.uuid = udev::partition_uuid(info).map(str::to_string);
                device.part_start = udev::partition_start(info);
                device.logical = udev::is_logical_partition(info);
                let parent = info
                    .get("DEVPATH")
                    .and_then(|p| p.rsplit('/').nth(1))
                    .and_then(|disk| self.find_by_name(disk, true));
                device.parents.extend(parent);
            }
            DeviceKind::Md => device.uuid = udev::md_uuid(info).map(str::to_string),
            _ => {}
        }

        info!("discovered {}", device);
        let id = self.insert(device);
        self.detect_format(id, info);
        if let Some(device) = self.device_mut(id) {
            device.original_format = device.format.clone();
        }
        Some(id)
    }

    fn recursive_remove(&mut self, id: DeviceId) {
        for child in self.children(id) {
            self.recursive_remove(child);
        }
        if self.referenced_by_action(id) {
            if let Some(slot) = self.arena.get_mut(&id) {
                slot.placement = Placement::Detached;
            }
        } else {
            self.arena.remove(&id);
        }
        debug!("removed {} from the tree", id);
    }

    fn remove_parent(&mut self, child: DeviceId, parent: DeviceId) -> bool {
        let Some(device) = self.device_mut(child) else {
            return false;
        };
        let before = device.parents.len();
        device.parents.retain(|p| *p != parent);
        device.parents.len() != before
    }

    fn cancel_disk_actions(&mut self, disks: &[DeviceId]) {
        let actions = std::mem::take(&mut self.actions);
        let (cancelled, kept): (Vec<_>, Vec<_>) = actions
            .into_iter()
            .partition(|a| self.action_touches(a.device, disks));
        self.actions = kept;

        for action in &cancelled {
            info!("cancelled action: {}", action.description);
            let detached = self
                .arena
                .get(&action.device)
                .is_some_and(|s| s.placement == Placement::Detached);
            if detached && !self.referenced_by_action(action.device) {
                self.arena.remove(&action.device);
            }
        }
    }

    fn detect_format(&mut self, id: DeviceId, info: &Attributes) {
        let Some(device) = self.device(id) else {
            return;
        };
        let mut format = Format::from_udev(&self.ctx, info, device.partitionable);
        if format.format_type == "lvmpv" {
            if let Some(pv) = self.pv_info.get(&device.path()) {
                format.container_uuid = Some(pv.vg_uuid.clone());
                format.vg_name = Some(pv.vg_name.clone());
                format.pe_start = Some(pv.pe_start);
            }
        }
        debug!("detected {:?} format on {}", format.format_type, device.name);
        if let Some(device) = self.device_mut(id) {
            device.format = format;
        }
    }

    fn pv_info(&self, path: &str) -> Option<PvInfo> {
        self.pv_info.get(path).cloned()
    }

    fn drop_lvm_cache(&mut self) {
        self.lvm_cache_generation += 1;
    }

    fn clear(&mut self) {
        self.arena.clear();
        self.actions.clear();
        self.processing = false;
    }
}

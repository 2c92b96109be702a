//! Reconciliation of uevents against the device model.
//!
//! Each event is first offered to the synchronizers of the device it names
//! (operation correlation). If no in-flight operation claims it, the event
//! is treated as an out-of-band change and applied to the [`DeviceTree`]
//! directly: adds insert externally created devices, changes refresh size,
//! names, formats and container membership, removes are deactivations.
//!
//! All model access happens under the shared lock. The lock is only
//! released while a handshake is parked inside a synchronizer.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, error, info, warn};

use crate::config::ReconcileConfig;
use crate::error::{EventError, EventResult};
use crate::event::{Action, Attributes, Event};
use crate::flags::Phase;
use crate::manager::EventManager;
use crate::probe::DeviceProbe;
use crate::sync::{SharedLock, SyncHandle};
use crate::tree::{Device, DeviceId, DeviceTree, Format};
use crate::udev;

const EVENT_LOG: &str = "blockwatch::event";
const BLOCK_SUBSYSTEM: &str = "block";

/// Which correlation rule claimed an event, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRule {
    /// Device creation confirmed by add/change.
    Create,
    /// Device activation confirmed by add/change.
    Setup,
    /// Deactivation of a device that never reports a remove.
    SilentTeardown,
    /// Resize confirmed by change.
    Resize,
    /// Validated change on the device itself.
    Change,
    /// Validated change to the current format.
    FormatChange,
    /// Validated change to the original format.
    OriginalFormatChange,
    /// Deactivation confirmed by remove.
    Teardown,
    /// Destruction confirmed by remove.
    Destroy,
}

impl fmt::Display for SyncRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            SyncRule::Create => "create",
            SyncRule::Setup => "setup",
            SyncRule::SilentTeardown | SyncRule::Teardown => "teardown",
            SyncRule::Resize => "resize",
            SyncRule::Change => "change",
            SyncRule::FormatChange => "change format of",
            SyncRule::OriginalFormatChange => "change original format of",
            SyncRule::Destroy => "destroy",
        };
        f.write_str(verb)
    }
}

/// Matches events to devices and drives operation correlation.
pub struct ReconciliationDispatcher<T: DeviceTree> {
    lock: SharedLock<T>,
    probe: Arc<dyn DeviceProbe>,
    config: ReconcileConfig,
}

impl<T: DeviceTree + 'static> ReconciliationDispatcher<T> {
    /// Create a dispatcher over the model behind `lock`.
    pub fn new(lock: SharedLock<T>, probe: Arc<dyn DeviceProbe>, config: ReconcileConfig) -> Self {
        Self {
            lock,
            probe,
            config,
        }
    }

    /// The shared lock guarding the model.
    pub fn lock(&self) -> &SharedLock<T> {
        &self.lock
    }

    /// Register this dispatcher as `manager`'s handler.
    pub fn attach(self: &Arc<Self>, manager: &Arc<EventManager>) {
        let dispatcher = Arc::downgrade(self);
        let weak_manager = Arc::downgrade(manager);
        manager.set_handler(move || {
            if let (Some(dispatcher), Some(manager)) = (dispatcher.upgrade(), weak_manager.upgrade()) {
                dispatcher.handle_next(&manager);
            }
        });
    }

    /// Handle the oldest queued event. Runs on an event worker.
    pub fn handle_next(&self, manager: &EventManager) {
        let mut guard = self.lock.lock();
        if !manager.is_enabled() {
            return;
        }

        let event = match manager.next_event() {
            Ok(event) => event,
            Err(EventError::QueueEmpty) => {
                debug!(target: EVENT_LOG, "uevent queue is empty");
                return;
            }
            Err(e) => {
                error!(target: EVENT_LOG, "failed to dequeue uevent: {}", e);
                return;
            }
        };
        // errors are scoped to this event and already logged
        let _ = self.dispatch(&mut guard, &event);
    }

    /// Reconcile one event, taking the shared lock.
    pub fn process(&self, event: &Event) -> EventResult<()> {
        let mut guard = self.lock.lock();
        self.dispatch(&mut guard, event)
    }

    fn dispatch(&self, guard: &mut MutexGuard<'_, T>, event: &Event) -> EventResult<()> {
        debug!(target: EVENT_LOG, "-- {}", event);
        let result = match event.action() {
            Action::Add => self.device_added(guard, event, false),
            Action::Change => self.device_changed(guard, event, false),
            Action::Remove => self.device_removed(guard, event),
            Action::Unknown(_) => {
                info!(target: EVENT_LOG, "unknown event: {}", event);
                Ok(())
            }
        };
        if let Err(e) = &result {
            error!(target: EVENT_LOG, "aborting {}: {}", event, e);
        }
        debug!(target: EVENT_LOG, "<- {}", event);
        result
    }

    fn name_matches(&self, device: &Device, name: &str) -> bool {
        if device.name == name {
            return true;
        }
        // md arrays can lose their symbolic name before the remove event
        self.config
            .sysfs_alias_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
            && !device.sysfs_path.is_empty()
            && Path::new(&device.sysfs_path)
                .file_name()
                .and_then(|n| n.to_str())
                == Some(name)
    }

    /// The device an event may confirm an operation on: it must match by
    /// name and have a synchronizer awaiting an event.
    pub fn locate(&self, tree: &T, event: &Event) -> Option<DeviceId> {
        let name = event.device_name();
        let mut candidates = tree.devices();
        for id in tree.action_devices() {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }
        candidates.into_iter().find(|id| {
            tree.device(*id)
                .is_some_and(|d| self.name_matches(d, name) && d.awaiting_sync())
        })
    }

    fn is_silent_teardown(&self, name: &str) -> bool {
        self.config
            .silent_teardown_prefixes
            .iter()
            .any(|p| name.starts_with(p.as_str()))
    }

    fn select_rule(
        &self,
        device: &Device,
        event: &Event,
    ) -> EventResult<Option<(SyncRule, SyncHandle)>> {
        let action = event.action();
        let add_or_change = matches!(action, Action::Add | Action::Change);
        let is_change = *action == Action::Change;
        let is_remove = *action == Action::Remove;
        let modify = device.modify_sync();
        let control = device.control_sync();
        let format = device.format.event_sync();
        let original = device.original_format.event_sync();

        let rule = if add_or_change && modify.awaiting_sync() && modify.phase(Phase::Creating) {
            Some((SyncRule::Create, modify))
        } else if add_or_change && control.awaiting_sync() && control.phase(Phase::Starting) {
            Some((SyncRule::Setup, control))
        } else if add_or_change
            && control.awaiting_sync()
            && control.phase(Phase::Stopping)
            && self.is_silent_teardown(&device.name)
        {
            Some((SyncRule::SilentTeardown, control))
        } else if is_change && modify.awaiting_sync() && modify.phase(Phase::Resizing) {
            Some((SyncRule::Resize, modify))
        } else if is_change
            && control.awaiting_sync()
            && control.phase(Phase::Changing)
            && control.validate(event)?
        {
            Some((SyncRule::Change, control))
        } else if is_change && format.awaiting_sync() && format.validate(event)? {
            Some((SyncRule::FormatChange, format))
        } else if is_change && original.awaiting_sync() && original.validate(event)? {
            Some((SyncRule::OriginalFormatChange, original))
        } else if is_remove && control.awaiting_sync() && control.phase(Phase::Stopping) {
            Some((SyncRule::Teardown, control))
        } else if is_remove && modify.awaiting_sync() && modify.phase(Phase::Destroying) {
            Some((SyncRule::Destroy, modify))
        } else {
            None
        };
        Ok(rule.map(|(rule, sync)| (rule, Arc::clone(sync))))
    }

    /// Try to correlate `event` with an in-flight operation and, if one
    /// claims it, run the dispatcher side of the handshake.
    ///
    /// Returns true if the event was claimed.
    fn try_sync(&self, guard: &mut MutexGuard<'_, T>, event: &Event) -> EventResult<bool> {
        let info = event.attributes();
        let name = event.device_name();
        debug!(
            "sync {} {} ({})",
            event.action(),
            name,
            udev::sysfs_path(info)
        );

        let Some(id) = self.locate(guard, event) else {
            return Ok(false);
        };
        let selected = match guard.device(id) {
            Some(device) => {
                debug!("event device is '{}'", device);
                self.select_rule(device, event)?
                    .map(|(rule, sync)| (rule, sync, device.name.clone()))
            }
            None => None,
        };
        let Some((rule, sync, device_name)) = selected else {
            return Ok(false);
        };

        debug!(target: EVENT_LOG, "* {} {}", rule, device_name);
        if rule == SyncRule::Setup {
            // the device learns its sysfs path only later in the change handler
            if let Some(device) = guard.device_mut(id) {
                device.sysfs_path = udev::sysfs_path(info);
            }
        }

        sync.mark_matched();
        let timeout = self.config.handshake_timeout();
        debug!(target: EVENT_LOG, "waiting for ready {}", name);
        let ready = sync.wait_for_ready(guard, timeout);
        if ready.is_failure() {
            warn!(
                "{}: operation on {} never became ready ({:?})",
                event, device_name, ready
            );
            // leave the operation open for a later event
            sync.clear_matched();
            return Ok(false);
        }

        debug!(target: EVENT_LOG, "notify {}", name);
        if sync.phase(Phase::Creating) || sync.phase(Phase::Changing) {
            update_uuids(&mut **guard, id, info);
        }
        sync.notify(guard)?;
        debug!(target: EVENT_LOG, "wait {}", name);
        let finished = sync.wait(guard, timeout)?;
        if finished.is_failure() {
            warn!(
                "{}: operation on {} did not finish in time ({:?})",
                event, device_name, finished
            );
        }
        sync.release(guard);
        debug!(target: EVENT_LOG, "done synchronizing {}", name);
        Ok(true)
    }

    fn device_added(
        &self,
        guard: &mut MutexGuard<'_, T>,
        event: &Event,
        force: bool,
    ) -> EventResult<()> {
        let info = event.attributes();
        let sysfs_path = udev::sysfs_path(info);
        debug!("device added: {}", sysfs_path);
        if udev::subsystem(info) != Some(BLOCK_SUBSYSTEM) {
            return Ok(());
        }
        if !udev::is_initialized(info) {
            debug!("new device not initialized -- not processing it");
            return Ok(());
        }

        // md and dm adds carry no useful information; the change event that
        // follows does
        if !force && (udev::is_md(info) || udev::is_dm(info) || udev::has_anonymous_node(info)) {
            debug!("ignoring add event for {}", sysfs_path);
            return Ok(());
        }

        if self.try_sync(guard, event)? {
            // refresh size, uuids etc. of the confirmed device
            return self.device_changed(guard, event, true);
        }

        if guard.actions_processing() {
            debug!("ignoring unexpected event during action processing");
            return Ok(());
        }

        let name = event.device_name();
        if let Some(id) = guard.find_by_name(name, false) {
            if guard.device(id).is_some_and(|d| d.exists) {
                info!("{} is already in the tree", name);
                return Ok(());
            }
        }

        guard.insert_discovered(info);
        Ok(())
    }

    fn device_changed(
        &self,
        guard: &mut MutexGuard<'_, T>,
        event: &Event,
        expected: bool,
    ) -> EventResult<()> {
        let info = event.attributes();
        let sysfs_path = udev::sysfs_path(info);
        debug!("device changed: {}", sysfs_path);
        if udev::subsystem(info) != Some(BLOCK_SUBSYSTEM) {
            return Ok(());
        }
        if !udev::is_initialized(info) {
            debug!("new device not initialized -- not processing it");
            return Ok(());
        }

        let name = event.device_name();
        if self
            .config
            .transient_name_prefixes
            .iter()
            .any(|p| name.starts_with(p.as_str()))
        {
            return Ok(());
        }

        // by sysfs path first: a renamed device no longer matches by name;
        // by name second: an externally activated one has no sysfs path yet
        let mut device = guard.find_by_sysfs_path(&sysfs_path, true);
        if device.is_none() {
            device = guard.find_by_name(name, true);
            if let Some(d) = device.and_then(|id| guard.device_mut(id)) {
                if d.sysfs_path.is_empty() && d.status {
                    d.sysfs_path = sysfs_path.clone();
                }
            }
        }

        if !expected
            && device.is_none()
            && ((udev::is_md(info) && udev::md_uuid(info).is_some())
                || (udev::is_dm(info) && info.contains_key("DM_NAME")))
        {
            // md and dm devices are not really there until their first change
            return self.device_added(guard, event, true);
        }

        let expected = expected || self.try_sync(guard, event)?;

        if let Some(id) = device {
            if guard.device(id).is_some_and(|d| !d.exists) {
                return Err(EventError::ReconciliationInconsistency {
                    device: name.to_string(),
                });
            }
        }

        if !expected && guard.actions_processing() {
            debug!("ignoring unexpected event during action processing");
            return Ok(());
        }

        // the handshake may have released the lock; the record can be gone
        let Some(id) = device.filter(|id| guard.device(*id).is_some()) else {
            info!("device not found: {}", name);
            return Ok(());
        };

        self.apply_rename(&mut **guard, id, event);
        self.apply_change(&mut **guard, id, info, expected);
        Ok(())
    }

    fn apply_rename(&self, tree: &mut T, id: DeviceId, event: &Event) {
        let Some(device) = tree.device_mut(id) else {
            return;
        };
        let info = event.attributes();
        match (device.lv_name.as_deref(), udev::lv_name(info)) {
            (Some(old), Some(new)) if old != new => {
                info!("{} renamed to {}", old, new);
                device.lv_name = Some(new.to_string());
                device.name = event.device_name().to_string();
            }
            (None, _) if device.name != event.device_name() => {
                info!("{} renamed to {}", device.name, event.device_name());
                device.name = event.device_name().to_string();
            }
            _ => {}
        }
    }

    fn apply_change(&self, tree: &mut T, id: DeviceId, info: &Attributes, expected: bool) {
        let Some(device) = tree.device(id) else {
            return;
        };
        let path = device.path();
        if !self.probe.node_exists(&path) {
            info!("ignoring change uevent on device with no node ({})", path);
            return;
        }

        let disks = tree.disks(id);
        let current_size = self.probe.current_size(&device.sysfs_path);
        if let Some(size) = current_size {
            if expected || device.size != size {
                if !expected {
                    tree.cancel_disk_actions(&disks);
                }
                if let Some(device) = tree.device_mut(id) {
                    debug!("{} size {} -> {}", device.name, device.size, size);
                    device.size = size;
                }
            }
        }

        let Some(device) = tree.device(id) else {
            return;
        };
        if !expected && !device.format.exists {
            tree.cancel_disk_actions(&disks);
        }
        debug!("changed: {:?}", info);

        let Some(device) = tree.device(id) else {
            return;
        };
        let partitioned = device.partitionable && udev::part_table_type(info).is_some();
        let uuid = if partitioned {
            udev::disklabel_uuid(info).map(str::to_string)
        } else {
            member_uuid(device, info)
        };
        let new_type = Format::type_from_udev(udev::format_type(info));
        let old_type = device.format.format_type.clone();
        let type_changed = new_type != old_type && !(old_type == "disklabel" && partitioned);
        let uuid_changed = device.format.uuid.is_some() && device.format.uuid != uuid;
        let reformatted = uuid_changed || type_changed;
        let is_member = device.format.is_container_member();
        info!(
            "partitioned: {} type_changed: {} old type: {:?} new type: {:?}",
            partitioned, type_changed, old_type, new_type
        );
        info!("old uuid: {:?} ; new uuid: {:?}", device.format.uuid, uuid);

        if !type_changed {
            if let Some(device) = tree.device_mut(id) {
                if device.format.supports_label() {
                    device.format.label = udev::label(info).map(str::to_string);
                }
            }
            if !expected {
                update_uuids(tree, id, info);
            }
        }

        if expected {
            return;
        }

        if reformatted {
            info!("{} was reformatted from outside", path);
            tree.cancel_disk_actions(&disks);
            for child in tree.children(id) {
                tree.recursive_remove(child);
            }
            tree.detect_format(id, info);
        } else if partitioned {
            self.disklabel_changed(tree, id);
        } else if is_member {
            if old_type == "lvmpv" {
                tree.drop_lvm_cache();
            }
            member_changed(tree, id, info);
        }
    }

    fn disklabel_changed(&self, tree: &mut T, id: DeviceId) {
        let Some(device) = tree.device(id) else {
            return;
        };
        info!("checking for changes to disklabel on {}", device.name);
        let Some(label_uuid) = device.format.uuid.clone() else {
            return;
        };

        let mut on_disk: Vec<Attributes> = self
            .probe
            .block_devices()
            .into_iter()
            .filter(|d| {
                udev::disklabel_uuid(d) == Some(label_uuid.as_str())
                    && (udev::is_partition(d) || udev::is_dm_partition(d))
            })
            .collect();

        let mut removed = Vec::new();
        for old in tree.children(id) {
            let Some(part) = tree.device(old) else {
                continue;
            };
            if !part.exists {
                warn!("non-existent partition {} on changed disklabel", part.name);
                removed.push(old);
                continue;
            }

            // msdos logical partitions carry no stable uuid; match on start
            let found = if part.logical {
                on_disk.iter().position(|p| {
                    part.part_start.is_some() && udev::partition_start(p) == part.part_start
                })
            } else {
                on_disk.iter().position(|p| {
                    part.uuid.is_some() && udev::partition_uuid(p) == part.uuid.as_deref()
                })
            };
            match found {
                Some(at) => {
                    on_disk.remove(at);
                }
                None => {
                    info!("partition {} was removed", part.name);
                    removed.push(old);
                }
            }
        }

        if !removed.is_empty() || !on_disk.is_empty() {
            tree.cancel_disk_actions(&[id]);
        }

        for old in removed {
            // action cancellation may already have dropped it
            if tree.device(old).is_none() {
                continue;
            }
            tree.recursive_remove(old);
        }

        for new in on_disk {
            info!("partition {} was added", udev::device_name(&new));
            tree.insert_discovered(&new);
        }
    }

    fn device_removed(&self, guard: &mut MutexGuard<'_, T>, event: &Event) -> EventResult<()> {
        let info = event.attributes();
        debug!("device removed: {}", udev::sysfs_path(info));
        if udev::subsystem(info) != Some(BLOCK_SUBSYSTEM) {
            return Ok(());
        }

        if self.try_sync(guard, event)? {
            return Ok(());
        }

        if guard.actions_processing() {
            debug!("ignoring unexpected event during action processing");
            return Ok(());
        }

        // a remove is a deactivation: there is no way to tell it apart from
        // an unplug
        let Some(id) = guard.find_by_name(event.device_name(), false) else {
            return Ok(());
        };
        if let Some(device) = guard.device_mut(id) {
            device.sysfs_path.clear();
            device.format.clear_mount_state();
            device.original_format.clear_mount_state();
        }
        Ok(())
    }
}

fn member_uuid(device: &Device, info: &Attributes) -> Option<String> {
    let uuid = match device.format.format_type.as_str() {
        "btrfs" => udev::sub_uuid(info),
        "mdmember" => udev::md_device_uuid(info),
        _ => udev::uuid(info),
    };
    uuid.map(str::to_string)
}

fn container_uuid<T: DeviceTree + ?Sized>(
    tree: &T,
    device: &Device,
    info: &Attributes,
) -> Option<String> {
    match device.format.format_type.as_str() {
        "btrfs" | "mdmember" => udev::uuid(info).map(str::to_string),
        // the volume group uuid is not in the udev database
        "lvmpv" => match tree.pv_info(&device.path()) {
            Some(pv) => Some(pv.vg_uuid),
            None => {
                error!("no pv info available for {}", device.name);
                None
            }
        },
        _ => None,
    }
}

/// Set the format uuid (and container uuid) of `id` from `info`.
fn update_uuids<T: DeviceTree + ?Sized>(tree: &mut T, id: DeviceId, info: &Attributes) {
    let Some(device) = tree.device(id) else {
        return;
    };
    let uuid = if device.partitionable && udev::part_table_type(info).is_some() {
        udev::disklabel_uuid(info).map(str::to_string)
    } else {
        member_uuid(device, info)
    };
    info!("old uuid: {:?} ; new uuid: {:?}", device.format.uuid, uuid);
    let is_member = device.format.is_container_member();
    let is_pv = device.format.format_type == "lvmpv";

    let mut container = None;
    if is_member {
        if is_pv {
            tree.drop_lvm_cache();
        }
        container = match tree.device(id) {
            Some(device) => container_uuid(&*tree, device, info),
            None => None,
        };
        if let Some(child) = tree.children(id).first().copied() {
            if let Some(child) = tree.device_mut(child) {
                child.uuid = container.clone();
            }
        }
    }

    if let Some(device) = tree.device_mut(id) {
        device.format.uuid = uuid;
        if is_member {
            device.format.container_uuid = container;
        }
    }
}

fn member_changed<T: DeviceTree + ?Sized>(tree: &mut T, id: DeviceId, info: &Attributes) {
    let Some(device) = tree.device(id) else {
        return;
    };
    if !device.format.is_container_member() {
        return;
    }
    let uuid = member_uuid(device, info);
    let container_uuid = container_uuid(&*tree, device, info);
    let changed = device.format.container_uuid != container_uuid;
    let is_pv = device.format.format_type == "lvmpv";
    let path = device.path();
    let name = device.name.clone();

    let disks = tree.disks(id);
    if changed {
        tree.cancel_disk_actions(&disks);
    }

    let container = tree.children(id).first().copied();
    if let Some(c) = container {
        if tree.device(c).is_some_and(|d| !d.exists) {
            tree.cancel_disk_actions(&disks);
        }
    }

    if changed {
        if let Some(c) = container {
            let members = tree.device(c).map_or(0, |d| d.parents.len());
            if members <= 1 {
                tree.recursive_remove(c);
            } else if !tree.remove_parent(c, id) {
                error!("failed to remove {} from its container to reflect uevent", name);
            }
        }
        tree.detect_format(id, info);
        return;
    }

    let pv = if is_pv { tree.pv_info(&path) } else { None };
    if let Some(device) = tree.device_mut(id) {
        device.format.container_uuid = container_uuid;
        device.format.uuid = uuid;
        if let Some(pv) = &pv {
            device.format.vg_name = Some(pv.vg_name.clone());
            device.format.pe_start = Some(pv.pe_start);
        }
    }
    if let (Some(pv), Some(c)) = (pv, container) {
        if let Some(vg) = tree.device_mut(c) {
            if vg.name != pv.vg_name {
                info!("volume group {} renamed to {}", vg.name, pv.vg_name);
                vg.name = pv.vg_name;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::probe::FixedProbe;
    use crate::sync::{MonitorSwitch, SyncContext, WaitOutcome};
    use crate::tree::{DeviceKind, InMemoryTree, PvInfo};
    use crate::validator::RequiredValue;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        lock: SharedLock<InMemoryTree>,
        probe: Arc<FixedProbe>,
        dispatcher: ReconciliationDispatcher<InMemoryTree>,
        ctx: SyncContext,
    }

    fn fixture() -> Fixture {
        fixture_with_timeout(5_000)
    }

    fn fixture_with_timeout(handshake_timeout_ms: u64) -> Fixture {
        let ctx = SyncContext::new(
            MonitorSwitch::new(true),
            &SyncConfig {
                ready_poll_ms: 5,
                default_timeout_ms: None,
            },
        );
        let lock = Arc::new(Mutex::new(InMemoryTree::new(ctx.clone())));
        let probe = Arc::new(FixedProbe::new());
        let config = ReconcileConfig {
            handshake_timeout_ms: Some(handshake_timeout_ms),
            ..ReconcileConfig::default()
        };
        let dispatcher = ReconciliationDispatcher::new(
            Arc::clone(&lock),
            Arc::clone(&probe) as Arc<dyn DeviceProbe>,
            config,
        );
        Fixture {
            lock,
            probe,
            dispatcher,
            ctx,
        }
    }

    fn event(action: Action, pairs: &[(&str, &str)]) -> Event {
        let mut attrs: Attributes = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        attrs.entry("SUBSYSTEM".into()).or_insert_with(|| "block".into());
        attrs
            .entry("USEC_INITIALIZED".into())
            .or_insert_with(|| "1".into());
        Event::new(action, attrs)
    }

    fn existing(f: &Fixture, name: &str, kind: DeviceKind, sysfs: &str) -> DeviceId {
        let mut dev = Device::new(&f.ctx, name, kind);
        dev.exists = true;
        dev.status = true;
        dev.sysfs_path = sysfs.to_string();
        f.probe.add_node(&dev.path());
        f.lock.lock().insert(dev)
    }

    #[test]
    fn test_unmatched_remove_is_noop() {
        let f = fixture();
        let id = existing(&f, "sda", DeviceKind::Disk, "/sys/block/sda");
        f.dispatcher
            .process(&event(Action::Remove, &[("DEVNAME", "/dev/sdq")]))
            .unwrap();
        let tree = f.lock.lock();
        assert_eq!(tree.devices(), vec![id]);
        assert_eq!(tree.device(id).unwrap().sysfs_path, "/sys/block/sda");
    }

    #[test]
    fn test_remove_is_deactivation() {
        let f = fixture();
        let id = existing(&f, "sdb1", DeviceKind::Partition, "/sys/block/sdb/sdb1");
        {
            let mut tree = f.lock.lock();
            let dev = tree.device_mut(id).unwrap();
            dev.format.mountpoint = Some("/mnt".into());
            dev.format.mounted_read_only = true;
            dev.original_format.mountpoint = Some("/mnt".into());
        }
        f.dispatcher
            .process(&event(Action::Remove, &[("DEVNAME", "/dev/sdb1")]))
            .unwrap();

        let tree = f.lock.lock();
        let dev = tree.device(id).unwrap();
        assert!(dev.sysfs_path.is_empty());
        assert!(dev.exists);
        assert_eq!(dev.format.mountpoint, None);
        assert!(!dev.format.mounted_read_only);
        assert_eq!(dev.original_format.mountpoint, None);
    }

    #[test]
    fn test_external_add_inserts_device() {
        let f = fixture();
        f.dispatcher
            .process(&event(
                Action::Add,
                &[
                    ("DEVNAME", "/dev/sdc"),
                    ("DEVPATH", "/devices/pci0000:00/block/sdc"),
                    ("ID_FS_TYPE", "xfs"),
                ],
            ))
            .unwrap();
        let tree = f.lock.lock();
        let id = tree.find_by_name("sdc", false).unwrap();
        assert_eq!(tree.device(id).unwrap().format.format_type, "xfs");
    }

    #[test]
    fn test_ignored_adds() {
        let f = fixture();
        let cases = [
            event(Action::Add, &[("DEVNAME", "/dev/sdd"), ("SUBSYSTEM", "net")]),
            Event::new(
                Action::Add,
                [("DEVNAME", "/dev/sdd"), ("SUBSYSTEM", "block")]
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            event(Action::Add, &[("DEVNAME", "/dev/dm-3")]),
            event(Action::Add, &[("DEVNAME", "/dev/md127"), ("MD_LEVEL", "raid1")]),
        ];
        for e in &cases {
            f.dispatcher.process(e).unwrap();
        }
        assert!(f.lock.lock().devices().is_empty());

        f.lock.lock().set_processing(true);
        f.dispatcher
            .process(&event(Action::Add, &[("DEVNAME", "/dev/sde")]))
            .unwrap();
        assert!(f.lock.lock().devices().is_empty());
    }

    #[test]
    fn test_add_for_known_device_is_ignored() {
        let f = fixture();
        existing(&f, "sdf", DeviceKind::Disk, "/sys/block/sdf");
        f.dispatcher
            .process(&event(Action::Add, &[("DEVNAME", "/dev/sdf")]))
            .unwrap();
        assert_eq!(f.lock.lock().devices().len(), 1);
    }

    #[test]
    fn test_change_for_non_existent_device_aborts() {
        let f = fixture();
        let mut dev = Device::new(&f.ctx, "sdg", DeviceKind::Disk);
        dev.sysfs_path = "/sys/block/sdg".into();
        f.lock.lock().insert(dev);

        let err = f
            .dispatcher
            .process(&event(
                Action::Change,
                &[("DEVNAME", "/dev/sdg"), ("DEVPATH", "/block/sdg")],
            ))
            .unwrap_err();
        assert!(matches!(
            err,
            EventError::ReconciliationInconsistency { ref device } if device == "sdg"
        ));
    }

    #[test]
    fn test_transient_names_are_ignored() {
        let f = fixture();
        let mut dev = Device::new(&f.ctx, "temporary-cryptsetup-42", DeviceKind::DeviceMapper);
        dev.exists = false;
        f.lock.lock().insert(dev);
        f.dispatcher
            .process(&event(
                Action::Change,
                &[("DEVNAME", "/dev/dm-9"), ("DM_NAME", "temporary-cryptsetup-42")],
            ))
            .unwrap();
    }

    #[test]
    fn test_external_resize_updates_size_and_cancels_actions() {
        let f = fixture();
        let id = existing(&f, "sdh", DeviceKind::Disk, "/sys/block/sdh");
        {
            let mut tree = f.lock.lock();
            let dev = tree.device_mut(id).unwrap();
            dev.size = 1 << 30;
            dev.format = Format::new(&f.ctx, "ext4");
            dev.format.exists = true;
            dev.format.uuid = Some("fs".into());
            tree.schedule_action(id, "resize sdh");
        }
        f.probe.set_size("/sys/block/sdh", 2 << 30);
        f.dispatcher
            .process(&event(
                Action::Change,
                &[
                    ("DEVNAME", "/dev/sdh"),
                    ("DEVPATH", "/block/sdh"),
                    ("ID_FS_TYPE", "ext4"),
                    ("ID_FS_UUID", "fs"),
                    ("ID_FS_LABEL", "scratch"),
                ],
            ))
            .unwrap();

        let tree = f.lock.lock();
        let dev = tree.device(id).unwrap();
        assert_eq!(dev.size, 2 << 30);
        assert_eq!(dev.format.label.as_deref(), Some("scratch"));
        assert!(tree.actions().is_empty());
    }

    #[test]
    fn test_change_without_node_is_skipped() {
        let f = fixture();
        let id = existing(&f, "sdi", DeviceKind::Disk, "/sys/block/sdi");
        f.probe.remove_node("/dev/sdi");
        f.probe.set_size("/sys/block/sdi", 4096);
        f.dispatcher
            .process(&event(
                Action::Change,
                &[("DEVNAME", "/dev/sdi"), ("DEVPATH", "/block/sdi")],
            ))
            .unwrap();
        assert_eq!(f.lock.lock().device(id).unwrap().size, 0);
    }

    #[test]
    fn test_external_reformat_replaces_children() {
        let f = fixture();
        let disk = existing(&f, "sdj", DeviceKind::Disk, "/sys/block/sdj");
        let part = existing(&f, "sdj1", DeviceKind::Partition, "/sys/block/sdj/sdj1");
        {
            let mut tree = f.lock.lock();
            tree.device_mut(part).unwrap().parents.push(disk);
            let dev = tree.device_mut(disk).unwrap();
            dev.format = Format::new(&f.ctx, "disklabel");
            dev.format.exists = true;
            dev.format.uuid = Some("old-label".into());
        }
        f.dispatcher
            .process(&event(
                Action::Change,
                &[
                    ("DEVNAME", "/dev/sdj"),
                    ("DEVPATH", "/block/sdj"),
                    ("ID_FS_TYPE", "LVM2_member"),
                    ("ID_FS_UUID", "pv-uuid"),
                ],
            ))
            .unwrap();

        let tree = f.lock.lock();
        assert!(tree.device(part).is_none());
        let dev = tree.device(disk).unwrap();
        assert_eq!(dev.format.format_type, "lvmpv");
        assert_eq!(dev.format.uuid.as_deref(), Some("pv-uuid"));
    }

    #[test]
    fn test_disklabel_change_diffs_partitions() {
        let f = fixture();
        let disk = existing(&f, "sdk", DeviceKind::Disk, "/sys/block/sdk");
        let kept = existing(&f, "sdk1", DeviceKind::Partition, "/sys/block/sdk/sdk1");
        let gone = existing(&f, "sdk2", DeviceKind::Partition, "/sys/block/sdk/sdk2");
        {
            let mut tree = f.lock.lock();
            for (id, uuid) in [(kept, "p1"), (gone, "p2")] {
                let dev = tree.device_mut(id).unwrap();
                dev.parents.push(disk);
                dev.uuid = Some(uuid.into());
            }
            let dev = tree.device_mut(disk).unwrap();
            dev.format = Format::new(&f.ctx, "disklabel");
            dev.format.exists = true;
            dev.format.uuid = Some("label".into());
        }
        let part = |name: &str, uuid: &str| -> Attributes {
            [
                ("DEVNAME", format!("/dev/{}", name)),
                ("DEVPATH", format!("/block/sdk/{}", name)),
                ("DEVTYPE", "partition".to_string()),
                ("ID_PART_TABLE_UUID", "label".to_string()),
                ("ID_PART_ENTRY_UUID", uuid.to_string()),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
        };
        f.probe
            .set_block_devices(vec![part("sdk1", "p1"), part("sdk3", "p3")]);

        f.dispatcher
            .process(&event(
                Action::Change,
                &[
                    ("DEVNAME", "/dev/sdk"),
                    ("DEVPATH", "/block/sdk"),
                    ("ID_PART_TABLE_TYPE", "gpt"),
                    ("ID_PART_TABLE_UUID", "label"),
                ],
            ))
            .unwrap();

        let tree = f.lock.lock();
        assert!(tree.device(kept).is_some());
        assert!(tree.device(gone).is_none());
        let added = tree.find_by_name("sdk3", false).unwrap();
        assert_eq!(tree.device(added).unwrap().parents, vec![disk]);
    }

    #[test]
    fn test_pv_change_follows_vg_rename() {
        let f = fixture();
        let pv = existing(&f, "sdl", DeviceKind::Disk, "/sys/block/sdl");
        let vg = {
            let mut tree = f.lock.lock();
            let dev = tree.device_mut(pv).unwrap();
            dev.format = Format::new(&f.ctx, "lvmpv");
            dev.format.exists = true;
            dev.format.uuid = Some("pv-uuid".into());
            dev.format.container_uuid = Some("vg-uuid".into());
            let mut vg = Device::new(&f.ctx, "old", DeviceKind::VolumeGroup);
            vg.exists = true;
            vg.parents.push(pv);
            tree.set_pv_info(
                "/dev/sdl",
                PvInfo {
                    vg_name: "new".into(),
                    vg_uuid: "vg-uuid".into(),
                    pe_start: 1 << 20,
                },
            );
            tree.insert(vg)
        };
        f.dispatcher
            .process(&event(
                Action::Change,
                &[
                    ("DEVNAME", "/dev/sdl"),
                    ("DEVPATH", "/block/sdl"),
                    ("ID_FS_TYPE", "LVM2_member"),
                    ("ID_FS_UUID", "pv-uuid"),
                ],
            ))
            .unwrap();

        let tree = f.lock.lock();
        assert_eq!(tree.device(vg).unwrap().name, "new");
        let fmt = &tree.device(pv).unwrap().format;
        assert_eq!(fmt.vg_name.as_deref(), Some("new"));
        assert!(tree.lvm_cache_generation() > 0);
    }

    #[test]
    fn test_correlated_create_updates_uuid() {
        let f = fixture();
        let id = {
            let mut dev = Device::new(&f.ctx, "sdm1", DeviceKind::Partition);
            dev.format = Format::new(&f.ctx, "xfs");
            f.probe.add_node("/dev/sdm1");
            f.lock.lock().insert(dev)
        };
        let sync = f.lock.lock().device(id).unwrap().modify_sync().clone();
        sync.set_phase(Phase::Creating, true).unwrap();

        let controller = {
            let lock = Arc::clone(&f.lock);
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                let mut tree = lock.lock();
                let confirmed = sync
                    .confirm(&mut tree, Some(Duration::from_secs(5)), |tree| {
                        tree.device_mut(id).unwrap().exists = true;
                    })
                    .unwrap();
                let matched = sync.is_matched();
                sync.reset(&tree);
                (confirmed, matched)
            })
        };

        f.dispatcher
            .process(&event(
                Action::Add,
                &[
                    ("DEVNAME", "/dev/sdm1"),
                    ("DEVPATH", "/block/sdm/sdm1"),
                    ("ID_FS_TYPE", "xfs"),
                    ("ID_FS_UUID", "new-fs-uuid"),
                ],
            ))
            .unwrap();

        assert_eq!(controller.join().unwrap(), (true, true));
        let tree = f.lock.lock();
        let dev = tree.device(id).unwrap();
        assert!(dev.exists);
        assert_eq!(dev.format.uuid.as_deref(), Some("new-fs-uuid"));
        assert_eq!(tree.devices().len(), 1);
    }

    #[test]
    fn test_late_controller_leaves_create_open() {
        let f = fixture_with_timeout(30);
        let id = {
            let mut dev = Device::new(&f.ctx, "sdn1", DeviceKind::Partition);
            dev.format = Format::new(&f.ctx, "xfs");
            f.probe.add_node("/dev/sdn1");
            let mut tree = f.lock.lock();
            tree.set_processing(true);
            tree.insert(dev)
        };
        let sync = f.lock.lock().device(id).unwrap().modify_sync().clone();
        sync.set_phase(Phase::Creating, true).unwrap();
        let add = |uuid: &str| {
            event(
                Action::Add,
                &[
                    ("DEVNAME", "/dev/sdn1"),
                    ("DEVPATH", "/block/sdn/sdn1"),
                    ("ID_FS_TYPE", "xfs"),
                    ("ID_FS_UUID", uuid),
                ],
            )
        };

        // nobody is ready yet: the dispatcher gives up without claiming it
        f.dispatcher.process(&add("early-uuid")).unwrap();
        assert!(!sync.is_matched());
        assert!(sync.awaiting_sync());
        {
            let tree = f.lock.lock();
            assert_eq!(tree.devices(), vec![id]);
            assert_eq!(tree.device(id).unwrap().format.uuid, None);
        }

        // a later event still confirms the operation
        let controller = {
            let lock = Arc::clone(&f.lock);
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                let mut tree = lock.lock();
                let confirmed = sync
                    .confirm(&mut tree, Some(Duration::from_secs(5)), |tree| {
                        tree.device_mut(id).unwrap().exists = true;
                    })
                    .unwrap();
                let matched = sync.is_matched();
                sync.reset(&tree);
                (confirmed, matched)
            })
        };
        while !sync.is_ready() {
            thread::sleep(Duration::from_millis(1));
        }
        f.dispatcher.process(&add("late-uuid")).unwrap();

        assert_eq!(controller.join().unwrap(), (true, true));
        let tree = f.lock.lock();
        assert_eq!(tree.device(id).unwrap().format.uuid.as_deref(), Some("late-uuid"));
    }

    #[test]
    fn test_controller_reset_cancels_parked_dispatcher() {
        let f = fixture();
        let id = {
            let dev = Device::new(&f.ctx, "sdp1", DeviceKind::Partition);
            f.probe.add_node("/dev/sdp1");
            let mut tree = f.lock.lock();
            tree.set_processing(true);
            tree.insert(dev)
        };
        let sync = f.lock.lock().device(id).unwrap().modify_sync().clone();
        sync.set_phase(Phase::Creating, true).unwrap();

        let dispatcher = Arc::new(f.dispatcher);
        let worker = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                dispatcher.process(&event(
                    Action::Add,
                    &[("DEVNAME", "/dev/sdp1"), ("DEVPATH", "/block/sdp/sdp1")],
                ))
            })
        };

        // the dispatcher claims the event, then parks waiting for ready
        while !sync.is_matched() {
            thread::sleep(Duration::from_millis(1));
        }
        {
            let tree = f.lock.lock();
            sync.reset(&tree);
        }

        assert!(worker.join().unwrap().is_ok());
        assert!(!sync.is_matched());
        assert!(!sync.is_active());
        assert!(!f.lock.lock().device(id).unwrap().exists);
    }

    #[test]
    fn test_dispatcher_finishes_when_controller_stalls() {
        let f = fixture_with_timeout(30);
        let id = existing(&f, "sdr", DeviceKind::Disk, "/sys/block/sdr");
        f.probe.set_size("/sys/block/sdr", 4 << 30);
        let sync = f.lock.lock().device(id).unwrap().modify_sync().clone();
        sync.set_phase(Phase::Resizing, true).unwrap();

        let controller = {
            let lock = Arc::clone(&f.lock);
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                let mut tree = lock.lock();
                let outcome = sync
                    .ready_wait(&mut tree, Some(Duration::from_secs(5)))
                    .unwrap();
                // never hand control back
                drop(tree);
                thread::sleep(Duration::from_millis(100));
                let tree = lock.lock();
                let matched = sync.is_matched();
                sync.reset(&tree);
                (outcome, matched)
            })
        };
        while !sync.is_ready() {
            thread::sleep(Duration::from_millis(1));
        }
        f.dispatcher
            .process(&event(
                Action::Change,
                &[("DEVNAME", "/dev/sdr"), ("DEVPATH", "/block/sdr")],
            ))
            .unwrap();

        assert_eq!(controller.join().unwrap(), (WaitOutcome::Notified, true));
        assert_eq!(f.lock.lock().device(id).unwrap().size, 4 << 30);
    }

    #[test]
    fn test_setup_records_sysfs_path() {
        let f = fixture();
        let id = existing(&f, "luks-1", DeviceKind::DeviceMapper, "");
        f.lock.lock().device_mut(id).unwrap().status = false;
        let sync = f.lock.lock().device(id).unwrap().control_sync().clone();
        sync.set_phase(Phase::Starting, true).unwrap();

        let controller = {
            let lock = Arc::clone(&f.lock);
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                let mut tree = lock.lock();
                let ok = sync.confirm(&mut tree, Some(Duration::from_secs(5)), |_| {}).unwrap();
                sync.reset(&tree);
                ok
            })
        };
        f.dispatcher
            .process(&event(
                Action::Change,
                &[
                    ("DEVNAME", "/dev/dm-4"),
                    ("DM_NAME", "luks-1"),
                    ("DEVPATH", "/devices/virtual/block/dm-4"),
                ],
            ))
            .unwrap();
        assert!(controller.join().unwrap());
        assert_eq!(
            f.lock.lock().device(id).unwrap().sysfs_path,
            "/sys/devices/virtual/block/dm-4"
        );
    }

    #[test]
    fn test_rule_priority() {
        let f = fixture();
        let dev = Device::new(&f.ctx, "loop0", DeviceKind::Loop);
        let change = event(Action::Change, &[("DEVNAME", "/dev/loop0")]);
        let remove = event(Action::Remove, &[("DEVNAME", "/dev/loop0")]);

        assert!(f.dispatcher.select_rule(&dev, &change).unwrap().is_none());

        dev.control_sync().set_phase(Phase::Stopping, true).unwrap();
        let (rule, _) = f.dispatcher.select_rule(&dev, &change).unwrap().unwrap();
        assert_eq!(rule, SyncRule::SilentTeardown);
        let (rule, _) = f.dispatcher.select_rule(&dev, &remove).unwrap().unwrap();
        assert_eq!(rule, SyncRule::Teardown);

        dev.modify_sync().set_phase(Phase::Resizing, true).unwrap();
        let (rule, _) = f.dispatcher.select_rule(&dev, &change).unwrap().unwrap();
        assert_eq!(rule, SyncRule::SilentTeardown);

        let disk = Device::new(&f.ctx, "sdn", DeviceKind::Disk);
        disk.control_sync().set_phase(Phase::Stopping, true).unwrap();
        let change = event(Action::Change, &[("DEVNAME", "/dev/sdn")]);
        assert!(f.dispatcher.select_rule(&disk, &change).unwrap().is_none());
    }

    #[test]
    fn test_change_rule_requires_validation() {
        let f = fixture();
        let dev = Device::new(&f.ctx, "sdo", DeviceKind::Disk);
        dev.control_sync().set_phase(Phase::Changing, true).unwrap();
        dev.control_sync()
            .update_requirements([("LVM_VG_NAME", RequiredValue::Exactly("data".into()))]);

        let wrong = event(Action::Change, &[("DEVNAME", "/dev/sdo"), ("LVM_VG_NAME", "other")]);
        assert!(f.dispatcher.select_rule(&dev, &wrong).unwrap().is_none());
        assert!(!dev.control_sync().is_matched());

        let right = event(Action::Change, &[("DEVNAME", "/dev/sdo"), ("LVM_VG_NAME", "data")]);
        let (rule, _) = f.dispatcher.select_rule(&dev, &right).unwrap().unwrap();
        assert_eq!(rule, SyncRule::Change);
        assert!(dev.control_sync().is_matched());
    }

    #[test]
    fn test_md_alias_lookup_by_sysfs_basename() {
        let f = fixture();
        let id = existing(&f, "home", DeviceKind::Md, "/sys/devices/virtual/block/md127");
        let dev_sync = f.lock.lock().device(id).unwrap().modify_sync().clone();
        let remove = event(Action::Remove, &[("DEVNAME", "/dev/md127")]);

        assert_eq!(f.dispatcher.locate(&f.lock.lock(), &remove), None);
        dev_sync.set_phase(Phase::Destroying, true).unwrap();
        assert_eq!(f.dispatcher.locate(&f.lock.lock(), &remove), Some(id));

        let other = event(Action::Remove, &[("DEVNAME", "/dev/sdx")]);
        assert_eq!(f.dispatcher.locate(&f.lock.lock(), &other), None);
    }

    #[test]
    fn test_unknown_action_is_logged_only() {
        let f = fixture();
        f.dispatcher
            .process(&event(Action::Unknown("bind".into()), &[("DEVNAME", "/dev/sda")]))
            .unwrap();
        assert!(f.lock.lock().devices().is_empty());
    }
}

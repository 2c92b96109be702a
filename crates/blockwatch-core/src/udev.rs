//! Accessors for well-known uevent attributes.

use std::path::Path;

use crate::event::Attributes;

fn get<'a>(info: &'a Attributes, key: &str) -> Option<&'a str> {
    info.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Friendly device name: the dm name, the md name, or the node basename.
pub fn device_name(info: &Attributes) -> String {
    if let Some(name) = get(info, "DM_NAME") {
        return name.to_string();
    }
    if let Some(name) = get(info, "MD_DEVNAME") {
        return name.to_string();
    }
    if let Some(devname) = get(info, "DEVNAME") {
        return basename(devname).to_string();
    }
    get(info, "DEVPATH").map(basename).unwrap_or_default().to_string()
}

/// `DEVNAME`, e.g. `/dev/sda1`.
pub fn devname(info: &Attributes) -> Option<&str> {
    get(info, "DEVNAME")
}

/// Absolute sysfs path (`/sys` + `DEVPATH`), or an empty string.
pub fn sysfs_path(info: &Attributes) -> String {
    get(info, "DEVPATH")
        .map(|p| format!("/sys{}", p))
        .unwrap_or_default()
}

/// Kernel subsystem (`block`, `net`, ...).
pub fn subsystem(info: &Attributes) -> Option<&str> {
    get(info, "SUBSYSTEM")
}

/// Returns true once udev has finished processing the device.
pub fn is_initialized(info: &Attributes) -> bool {
    info.contains_key("USEC_INITIALIZED")
}

/// Returns true for device-mapper devices.
pub fn is_dm(info: &Attributes) -> bool {
    get(info, "DM_NAME").is_some() || get(info, "DM_UUID").is_some() || is_numbered(info, "dm-")
}

/// Returns true for md arrays (not their members).
pub fn is_md(info: &Attributes) -> bool {
    get(info, "MD_LEVEL").is_some() || is_numbered(info, "md")
}

fn is_numbered(info: &Attributes, prefix: &str) -> bool {
    let name = get(info, "DEVNAME").map(basename).unwrap_or_default();
    name.strip_prefix(prefix)
        .map(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Returns true for `/dev/dm-N` and `/dev/md-N` style nodes, which carry no
/// symbolic name yet.
pub fn has_anonymous_node(info: &Attributes) -> bool {
    let Some(devname) = get(info, "DEVNAME") else {
        return false;
    };
    ["/dev/dm-", "/dev/md-"].iter().any(|prefix| {
        devname
            .strip_prefix(prefix)
            .map(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false)
    })
}

/// Returns true for partitions.
pub fn is_partition(info: &Attributes) -> bool {
    get(info, "DEVTYPE") == Some("partition")
}

/// Filesystem / format type (`ID_FS_TYPE`).
pub fn format_type(info: &Attributes) -> Option<&str> {
    get(info, "ID_FS_TYPE")
}

/// Filesystem / format UUID (`ID_FS_UUID`).
pub fn uuid(info: &Attributes) -> Option<&str> {
    get(info, "ID_FS_UUID")
}

/// Per-member UUID for multi-device formats (`ID_FS_UUID_SUB`).
pub fn sub_uuid(info: &Attributes) -> Option<&str> {
    get(info, "ID_FS_UUID_SUB")
}

/// Filesystem label (`ID_FS_LABEL`).
pub fn label(info: &Attributes) -> Option<&str> {
    get(info, "ID_FS_LABEL")
}

/// Partition table type, present when the device carries a disklabel.
pub fn part_table_type(info: &Attributes) -> Option<&str> {
    get(info, "ID_PART_TABLE_TYPE")
}

/// Disklabel UUID (`ID_PART_TABLE_UUID`).
pub fn disklabel_uuid(info: &Attributes) -> Option<&str> {
    get(info, "ID_PART_TABLE_UUID")
}

/// Partition UUID (`ID_PART_ENTRY_UUID`).
pub fn partition_uuid(info: &Attributes) -> Option<&str> {
    get(info, "ID_PART_ENTRY_UUID")
}

/// Returns true for partitions of device-mapper devices (e.g. multipath).
pub fn is_dm_partition(info: &Attributes) -> bool {
    get(info, "DM_UUID").is_some_and(|u| u.starts_with("part"))
}

/// Member UUID of an md array component (`ID_FS_UUID_SUB`).
pub fn md_device_uuid(info: &Attributes) -> Option<&str> {
    get(info, "ID_FS_UUID_SUB")
}

/// UUID of an md array (`MD_UUID`).
pub fn md_uuid(info: &Attributes) -> Option<&str> {
    get(info, "MD_UUID")
}

/// Partition start, in sectors (`ID_PART_ENTRY_OFFSET`).
pub fn partition_start(info: &Attributes) -> Option<u64> {
    get(info, "ID_PART_ENTRY_OFFSET").and_then(|v| v.parse().ok())
}

/// Returns true for logical partitions inside an msdos extended partition.
pub fn is_logical_partition(info: &Attributes) -> bool {
    get(info, "ID_PART_ENTRY_SCHEME") == Some("dos")
        && get(info, "ID_PART_ENTRY_NUMBER")
            .and_then(|n| n.parse::<u32>().ok())
            .is_some_and(|n| n > 4)
}

/// Logical volume name for LVM devices (`DM_LV_NAME`).
pub fn lv_name(info: &Attributes) -> Option<&str> {
    get(info, "DM_LV_NAME")
}

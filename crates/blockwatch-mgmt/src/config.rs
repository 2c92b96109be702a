//! Daemon configuration loaded from TOML or JSON.

use blockwatch_core::{ManagerConfig, ReconcileConfig, SyncConfig, SysfsProbe};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Daemon configuration: the core pipeline settings plus process-level knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log filter used when `RUST_LOG` is not set.
    pub log_filter: String,
    /// Whether the monitor subscribes to kernel events at startup.
    pub monitoring_enabled: bool,
    /// sysfs mount point.
    pub scan_sysfs_root: PathBuf,
    /// Device node directory.
    pub dev_root: PathBuf,
    /// udev database directory.
    pub udev_data_dir: PathBuf,
    /// Synchronizer timing.
    pub sync: SyncConfig,
    /// Event source settings.
    pub manager: ManagerConfig,
    /// Reconciliation matching rules.
    pub reconcile: ReconcileConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_filter: String::from("info"),
            monitoring_enabled: true,
            scan_sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            udev_data_dir: PathBuf::from("/run/udev/data"),
            sync: SyncConfig::default(),
            manager: ManagerConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: DaemonConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: DaemonConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::warn!("Config file not found, using defaults: {}", path.display());
            Ok(Self::default())
        }
    }

    /// A probe over the configured sysfs, `/dev` and udev roots.
    pub fn probe(&self) -> SysfsProbe {
        SysfsProbe::with_roots(
            self.scan_sysfs_root.clone(),
            self.dev_root.clone(),
            self.udev_data_dir.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockwatch_core::NetlinkGroup;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = DaemonConfig::default();
        assert_eq!(config.log_filter, "info");
        assert!(config.monitoring_enabled);
        assert_eq!(config.scan_sysfs_root, PathBuf::from("/sys"));
        assert_eq!(config.sync.ready_poll_ms, 100);
        assert_eq!(config.manager.subsystem, "block");
        assert_eq!(config.manager.netlink_group, NetlinkGroup::Udev);
        assert_eq!(
            config.reconcile.transient_name_prefixes,
            vec!["temporary-cryptsetup-".to_string()]
        );
        assert_eq!(config.reconcile.sysfs_alias_prefixes, vec!["md".to_string()]);
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
log_filter = "blockwatch=debug"
monitoring_enabled = false

[sync]
ready_poll_ms = 20
default_timeout_ms = 30000

[manager]
netlink_group = "kernel"

[reconcile]
handshake_timeout_ms = 60000
            "#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log_filter, "blockwatch=debug");
        assert!(!config.monitoring_enabled);
        assert_eq!(config.sync.ready_poll_ms, 20);
        assert_eq!(config.sync.default_timeout_ms, Some(30_000));
        assert_eq!(config.manager.netlink_group, NetlinkGroup::Kernel);
        assert_eq!(config.manager.subsystem, "block");
        assert_eq!(config.reconcile.handshake_timeout_ms, Some(60_000));
        assert_eq!(config.reconcile.sysfs_alias_prefixes, vec!["md".to_string()]);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "scan_sysfs_root": "/host/sys",
                "reconcile": {{ "transient_name_prefixes": [] }}
            }}"#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scan_sysfs_root, PathBuf::from("/host/sys"));
        assert!(config.reconcile.transient_name_prefixes.is_empty());
        assert_eq!(config.dev_root, PathBuf::from("/dev"));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = DaemonConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("yaml"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
    }
}

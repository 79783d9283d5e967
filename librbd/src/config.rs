//! Process-wide driver configuration.
//!
//! A [`DriverConfig`] is built once at startup, validated, and shared
//! read-only by every component. It can be read from a YAML file or from the
//! flat key/value map container hosts pass to volume drivers:
//!
//! - `ceph.servers`: comma separated monitor addresses.
//! - `ceph.user`, `ceph.secret`: cephx identity.
//! - `ceph.pool`: default pool. Defaults to `rancher`.
//! - `ceph.defaultvolumesize`: default image size. Defaults to `1G`.
//! - `ceph.cluster`, `ceph.conf`: cluster name and config file.
//! - `rbd.fstype`, `rbd.devprefix`, `rbd.timeout`, `rbd.format_timeout`,
//!   `rbd.hostid`: driver tuning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::VolumeError;
use crate::types::{format_size, parse_size};

pub const DRIVER_NAME: &str = "rbd";

pub const CEPH_SERVERS: &str = "ceph.servers";
pub const CEPH_SECRET: &str = "ceph.secret";
pub const CEPH_DEFAULT_VOLUME_POOL: &str = "ceph.pool";
pub const CEPH_DEFAULT_VOLUME_SIZE: &str = "ceph.defaultvolumesize";
pub const CEPH_DEFAULT_USER: &str = "ceph.user";
pub const CEPH_CLUSTER: &str = "ceph.cluster";
pub const CEPH_CONF: &str = "ceph.conf";
pub const RBD_FS_TYPE: &str = "rbd.fstype";
pub const RBD_DEVICE_PREFIX: &str = "rbd.devprefix";
pub const RBD_TIMEOUT: &str = "rbd.timeout";
pub const RBD_FORMAT_TIMEOUT: &str = "rbd.format_timeout";
pub const RBD_HOST_ID: &str = "rbd.hostid";

pub const DEFAULT_CLUSTER: &str = "ceph";
pub const DEFAULT_USER: &str = "admin";
pub const DEFAULT_VOLUME_POOL: &str = "rancher";
pub const DEFAULT_VOLUME_SIZE: &str = "1G";
pub const DEFAULT_FS_TYPE: &str = "ext4";
pub const DEFAULT_DEVICE_PREFIX: &str = "/dev/rbd";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_FORMAT_TIMEOUT_SECS: u64 = 600;

/// Directory under the root holding one mount point per volume.
pub const MOUNTS_DIR: &str = "mounts";
/// Directory under the root holding persisted volume records.
pub const VOLUMES_DIR: &str = "volumes";

/// Driver configuration. Immutable once the driver is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Scratch root for records and mount points.
    pub root: PathBuf,
    pub cluster: String,
    /// Monitor addresses. Empty means "use the ceph config file".
    pub servers: Vec<String>,
    pub user: String,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    /// Ceph config file, `/etc/ceph/<cluster>.conf` when unset.
    pub ceph_conf: Option<PathBuf>,
    pub default_pool: String,
    pub default_volume_size: String,
    pub default_fs_type: String,
    /// Prefix of kernel RBD devices, used by the in-memory backend.
    pub device_prefix: String,
    /// Bound on every backend and kernel step, in seconds.
    pub timeout_secs: u64,
    /// Bound on filesystem formatting, in seconds.
    pub format_timeout_secs: u64,
    /// Host identity override for the lock holder id.
    pub host_id: Option<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            cluster: DEFAULT_CLUSTER.to_owned(),
            servers: Vec::new(),
            user: DEFAULT_USER.to_owned(),
            secret: None,
            ceph_conf: None,
            default_pool: DEFAULT_VOLUME_POOL.to_owned(),
            default_volume_size: DEFAULT_VOLUME_SIZE.to_owned(),
            default_fs_type: DEFAULT_FS_TYPE.to_owned(),
            device_prefix: DEFAULT_DEVICE_PREFIX.to_owned(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            format_timeout_secs: DEFAULT_FORMAT_TIMEOUT_SECS,
            host_id: None,
        }
    }
}

impl DriverConfig {
    /// Defaults rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Build a configuration from the flat driver-options map.
    pub fn from_map(
        root: impl Into<PathBuf>,
        opts: &HashMap<String, String>,
    ) -> Result<Self, VolumeError> {
        let mut cfg = Self::new(root);
        for (key, value) in opts {
            match key.as_str() {
                CEPH_SERVERS => {
                    cfg.servers = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned)
                        .collect();
                }
                CEPH_SECRET => cfg.secret = Some(value.clone()).filter(|s| !s.is_empty()),
                CEPH_DEFAULT_VOLUME_POOL => cfg.default_pool = value.clone(),
                CEPH_DEFAULT_VOLUME_SIZE => cfg.default_volume_size = value.clone(),
                CEPH_DEFAULT_USER => cfg.user = value.clone(),
                CEPH_CLUSTER => cfg.cluster = value.clone(),
                CEPH_CONF => cfg.ceph_conf = Some(PathBuf::from(value)),
                RBD_FS_TYPE => cfg.default_fs_type = value.clone(),
                RBD_DEVICE_PREFIX => cfg.device_prefix = value.clone(),
                RBD_TIMEOUT => cfg.timeout_secs = parse_secs(key, value)?,
                RBD_FORMAT_TIMEOUT => cfg.format_timeout_secs = parse_secs(key, value)?,
                RBD_HOST_ID => cfg.host_id = Some(value.clone()),
                other => {
                    tracing::warn!(key = other, "ignoring unknown driver option");
                }
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read a YAML configuration file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, VolumeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| VolumeError::Config(format!("read {}: {e}", path.display())))?;
        let cfg: Self = serde_yaml::from_str(&text)
            .map_err(|e| VolumeError::Config(format!("parse {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the driver cannot run with.
    pub fn validate(&self) -> Result<(), VolumeError> {
        if self.root.as_os_str().is_empty() {
            return Err(VolumeError::Config("root directory is not set".into()));
        }
        if !self.root.is_absolute() {
            return Err(VolumeError::Config(format!(
                "root directory {} must be absolute",
                self.root.display()
            )));
        }
        for (what, value) in [
            ("cluster", &self.cluster),
            ("user", &self.user),
            ("default pool", &self.default_pool),
            ("default filesystem", &self.default_fs_type),
            ("device prefix", &self.device_prefix),
        ] {
            if value.trim().is_empty() {
                return Err(VolumeError::Config(format!("{what} is empty")));
            }
        }
        validate_fs_type(&self.default_fs_type)?;
        parse_size(&self.default_volume_size)?;
        if self.timeout_secs == 0 || self.format_timeout_secs == 0 {
            return Err(VolumeError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn default_size_bytes(&self) -> Result<u64, VolumeError> {
        parse_size(&self.default_volume_size)
    }

    pub fn ceph_conf_path(&self) -> PathBuf {
        self.ceph_conf
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/etc/ceph/{}.conf", self.cluster)))
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.root.join(VOLUMES_DIR)
    }

    pub fn mounts_dir(&self) -> PathBuf {
        self.root.join(MOUNTS_DIR)
    }

    /// Deterministic mount point of a volume, `<root>/mounts/<name>`.
    pub fn mount_point(&self, name: &str) -> PathBuf {
        self.mounts_dir().join(name)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn format_timeout(&self) -> Duration {
        Duration::from_secs(self.format_timeout_secs)
    }

    /// Key/value summary reported by the driver `info` operation. The secret
    /// is masked.
    pub fn info(&self) -> HashMap<String, String> {
        let size = self
            .default_size_bytes()
            .map(format_size)
            .unwrap_or_else(|_| self.default_volume_size.clone());
        HashMap::from([
            ("Root".to_owned(), self.root.display().to_string()),
            ("Cluster".to_owned(), self.cluster.clone()),
            ("RBDServers".to_owned(), format!("{:?}", self.servers)),
            ("RBDUser".to_owned(), self.user.clone()),
            (
                "RBDSecret".to_owned(),
                if self.secret.is_some() { "******" } else { "" }.to_owned(),
            ),
            ("DefaultVolumePool".to_owned(), self.default_pool.clone()),
            ("DefaultVolumeSize".to_owned(), size),
        ])
    }
}

/// Filesystem types are passed to `mkfs -t` and `mount -t`.
pub fn validate_fs_type(fs_type: &str) -> Result<(), VolumeError> {
    let ok = !fs_type.is_empty()
        && fs_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(VolumeError::Config(format!(
            "invalid filesystem type {fs_type:?}"
        )))
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64, VolumeError> {
    value
        .trim()
        .trim_end_matches('s')
        .parse()
        .map_err(|_| VolumeError::Config(format!("{key}: invalid duration {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn from_map_reads_ceph_keys() {
        let cfg = DriverConfig::from_map(
            "/var/lib/rancher/convoy/rbd",
            &opts(&[
                (CEPH_SERVERS, "172.16.70.16, 172.16.70.19,172.16.70.21"),
                (CEPH_DEFAULT_USER, "convoy"),
                (CEPH_SECRET, "AQBx"),
                (RBD_TIMEOUT, "30s"),
            ]),
        )
        .unwrap();

        assert_eq!(cfg.servers.len(), 3);
        assert_eq!(cfg.servers[1], "172.16.70.19");
        assert_eq!(cfg.user, "convoy");
        assert_eq!(cfg.secret.as_deref(), Some("AQBx"));
        assert_eq!(cfg.default_pool, DEFAULT_VOLUME_POOL);
        assert_eq!(cfg.default_size_bytes().unwrap(), 1 << 30);
        assert_eq!(cfg.step_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.ceph_conf_path(), PathBuf::from("/etc/ceph/ceph.conf"));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let bad_size = DriverConfig::from_map("/r", &opts(&[(CEPH_DEFAULT_VOLUME_SIZE, "lots")]));
        assert!(matches!(bad_size, Err(VolumeError::Config(_))));

        let relative = DriverConfig::from_map("relative/root", &HashMap::new());
        assert!(matches!(relative, Err(VolumeError::Config(_))));

        let bad_fs = DriverConfig::from_map("/r", &opts(&[(RBD_FS_TYPE, "ext4 -F")]));
        assert!(matches!(bad_fs, Err(VolumeError::Config(_))));

        let zero = DriverConfig::from_map("/r", &opts(&[(RBD_TIMEOUT, "0")]));
        assert!(matches!(zero, Err(VolumeError::Config(_))));
    }

    #[test]
    fn yaml_file_uses_defaults_for_missing_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rbd.yaml");
        std::fs::write(
            &path,
            "root: /var/lib/rbd\nservers: [mon-a, mon-b]\nsecret: s3cr3t\ndefault_pool: volumes\n",
        )
        .unwrap();

        let cfg = DriverConfig::from_yaml_file(&path).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/var/lib/rbd"));
        assert_eq!(cfg.servers, vec!["mon-a", "mon-b"]);
        assert_eq!(cfg.default_pool, "volumes");
        assert_eq!(cfg.user, DEFAULT_USER);
        assert_eq!(cfg.mount_point("data1"), PathBuf::from("/var/lib/rbd/mounts/data1"));
    }

    #[test]
    fn info_masks_secret() {
        let mut cfg = DriverConfig::new("/var/lib/rbd");
        cfg.secret = Some("AQBx".into());
        cfg.default_volume_size = "10G".into();
        let info = cfg.info();
        assert_eq!(info["RBDSecret"], "******");
        assert_eq!(info["DefaultVolumeSize"], "10G");
        assert!(!serde_json::to_string(&cfg).unwrap().contains("AQBx"));
    }
}

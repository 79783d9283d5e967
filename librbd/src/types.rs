//! Core data model: volume records, lifecycle states, lock identity and
//! request options.
//!
//! These types are shared by the registry, the managers and the backends. The
//! record types are [`Serialize`]/[`Deserialize`] because the registry
//! persists them as JSON and the CLI prints them.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::VolumeError;

/// Longest accepted volume name, in bytes.
pub const MAX_NAME_LEN: usize = 128;

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle state of a volume on this host.
///
/// Attach walks `Registered → Locked → Mapped → Mounted`; teardown walks the
/// same path backwards. Removal erases the record, so there is no `Removed`
/// variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    /// Known to this host, holding nothing.
    Registered,
    /// The backend lock is held under this host's identity.
    Locked,
    /// Mapped to a local kernel block device.
    Mapped,
    /// Mounted at the volume's mount point.
    Mounted,
    /// Reconciliation could not verify the recorded lock or device.
    Inconsistent,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registered => "registered",
            Self::Locked => "locked",
            Self::Mapped => "mapped",
            Self::Mounted => "mounted",
            Self::Inconsistent => "inconsistent",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Lock identity
// ---------------------------------------------------------------------------

/// Identity this process uses when taking backend locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderId {
    /// Host name (or the configured override).
    pub host: String,
    /// Process id of the driver.
    pub pid: u32,
}

impl HolderId {
    pub fn new(host: impl Into<String>, pid: u32) -> Self {
        Self {
            host: host.into(),
            pid,
        }
    }

    /// Identity of the running process, using the kernel host name unless
    /// `host_override` is set.
    pub fn local(host_override: Option<&str>) -> Result<Self, VolumeError> {
        let host = match host_override {
            Some(host) => host.to_owned(),
            None => nix::unistd::gethostname()
                .map_err(|e| VolumeError::Config(format!("gethostname: {e}")))?
                .to_string_lossy()
                .into_owned(),
        };
        Ok(Self::new(host, std::process::id()))
    }

    /// Lock id passed to the backend, `<host>:<pid>`.
    pub fn lock_id(&self) -> String {
        format!("{}:{}", self.host, self.pid)
    }

    /// Whether `lock_id` was produced by a process on this host.
    pub fn same_host(&self, lock_id: &str) -> bool {
        lock_id
            .rsplit_once(':')
            .is_some_and(|(host, _)| host == self.host)
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lock_id())
    }
}

/// Opaque proof of an exclusive backend lock.
///
/// `locker` is the cluster client entity that owns the lock (for RBD,
/// `client.<id>`); it is needed to release the lock after a restart, when this
/// process runs under a different client id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken {
    pub lock_id: String,
    pub locker: String,
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.lock_id, self.locker)
    }
}

/// A lock entry as listed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locker {
    pub token: LockToken,
    /// Network address of the locker, when the backend reports one.
    #[serde(default)]
    pub address: Option<String>,
}

/// Kernel block device currently mapped on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedDevice {
    pub pool: String,
    pub image: String,
    pub device: PathBuf,
}

// ---------------------------------------------------------------------------
// Volume record
// ---------------------------------------------------------------------------

/// Everything this host knows about one volume.
///
/// This is both the in-memory registry entry and the persisted record
/// layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Unique, caller-chosen name. Also the backing image name.
    pub name: String,
    pub pool: String,
    pub image: String,
    pub size_bytes: u64,
    pub fs_type: String,
    pub state: VolumeState,
    /// Local kernel device, set only while mapped.
    #[serde(default)]
    pub device: Option<PathBuf>,
    /// Mount point, set only while mounted.
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
    /// Backend lock held by this host.
    #[serde(default)]
    pub lock: Option<LockToken>,
    /// The backing image was created by this driver and never formatted.
    #[serde(default)]
    pub fresh: bool,
}

impl Volume {
    /// A newly registered volume.
    pub fn new(name: &str, spec: &VolumeSpec, fresh: bool) -> Self {
        Self {
            name: name.to_owned(),
            pool: spec.pool.clone(),
            image: name.to_owned(),
            size_bytes: spec.size_bytes,
            fs_type: spec.fs_type.clone(),
            state: VolumeState::Registered,
            device: None,
            mount_point: None,
            lock: None,
            fresh,
        }
    }

    /// The options this volume was created with.
    pub fn spec(&self) -> VolumeSpec {
        VolumeSpec {
            pool: self.pool.clone(),
            size_bytes: self.size_bytes,
            fs_type: self.fs_type.clone(),
        }
    }

    /// Drop every attachment field and go back to `Registered`.
    pub fn reset(&mut self) {
        self.state = VolumeState::Registered;
        self.device = None;
        self.mount_point = None;
        self.lock = None;
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Caller-supplied options for `create`. Unset fields fall back to the driver
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOptions {
    #[serde(default)]
    pub pool: Option<String>,
    /// Human-readable size such as `10G`.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub fs_type: Option<String>,
}

impl CreateOptions {
    /// Build options from the flat driver-options map sent by container
    /// hosts (`pool`, `size`, `fstype`).
    pub fn from_map(opts: &HashMap<String, String>) -> Result<Self, VolumeError> {
        let mut out = Self::default();
        for (key, value) in opts {
            match key.as_str() {
                "pool" => out.pool = Some(value.clone()),
                "size" => out.size = Some(value.clone()),
                "fstype" | "fs_type" => out.fs_type = Some(value.clone()),
                other => {
                    return Err(VolumeError::Config(format!("unknown volume option {other:?}")));
                }
            }
        }
        Ok(out)
    }
}

/// Fully resolved creation options. Two `create` calls are the same request
/// when their specs are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub pool: String,
    pub size_bytes: u64,
    pub fs_type: String,
}

/// Optional operation families, all unsupported by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub snapshot: bool,
    pub backup: bool,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Check that `name` is usable as both a file name and an RBD image name.
pub fn validate_name(name: &str) -> Result<(), VolumeError> {
    if name.is_empty() {
        return Err(VolumeError::Config("volume name is empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(VolumeError::Config(format!(
            "volume name longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(VolumeError::Config(format!(
            "volume name {name:?} must not start with '.' or '-'"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(VolumeError::Config(format!(
            "volume name {name:?} contains invalid character {c:?}"
        )));
    }
    Ok(())
}

const UNITS: [(char, u32); 5] = [('k', 1), ('m', 2), ('g', 3), ('t', 4), ('p', 5)];

/// Parse a size such as `1G`, `512M`, `10GiB` or a plain byte count.
/// Units are binary multiples.
pub fn parse_size(s: &str) -> Result<u64, VolumeError> {
    let invalid = || VolumeError::Config(format!("invalid size {s:?}"));
    let trimmed = s.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(digits_end);
    let number: u64 = number.parse().map_err(|_| invalid())?;

    let unit = unit.trim().to_ascii_lowercase();
    let unit = unit
        .strip_suffix("ib")
        .or_else(|| unit.strip_suffix('b'))
        .unwrap_or(unit.as_str());
    let bytes = match unit.chars().collect::<Vec<_>>().as_slice() {
        [] => Some(number),
        [c] => UNITS
            .iter()
            .find(|(u, _)| u == c)
            .and_then(|(_, exp)| number.checked_mul(1024u64.pow(*exp))),
        _ => None,
    }
    .ok_or_else(invalid)?;

    if bytes == 0 {
        return Err(VolumeError::Config(format!("size {s:?} must be positive")));
    }
    Ok(bytes)
}

/// Render a byte count with the largest binary unit that divides it exactly.
pub fn format_size(bytes: u64) -> String {
    for (unit, exp) in UNITS.iter().rev() {
        let base = 1024u64.pow(*exp);
        if bytes >= base && bytes % base == 0 {
            return format!("{}{}", bytes / base, unit.to_ascii_uppercase());
        }
    }
    bytes.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sizes() {
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_size("10G").unwrap(), 10 << 30);
        assert_eq!(parse_size("512m").unwrap(), 512 << 20);
        assert_eq!(parse_size("2GiB").unwrap(), 2 << 30);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("10X").is_err());
        assert!(parse_size("0").is_err());
    }

    #[test]
    fn format_sizes() {
        assert_eq!(format_size(10 << 30), "10G");
        assert_eq!(format_size(1536 << 20), "1536M");
        assert_eq!(format_size(1000), "1000");
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("data1").is_ok());
        assert!(validate_name("db_backup-2.v1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn holder_identity() {
        let id = HolderId::new("node-a", 42);
        assert_eq!(id.lock_id(), "node-a:42");
        assert!(id.same_host("node-a:7"));
        assert!(!id.same_host("node-b:42"));
        assert!(!id.same_host("garbage"));
    }

    #[test]
    fn create_options_from_map() {
        let opts = CreateOptions::from_map(&HashMap::from([
            ("size".to_owned(), "10G".to_owned()),
            ("pool".to_owned(), "rancher".to_owned()),
        ]))
        .unwrap();
        assert_eq!(opts.size.as_deref(), Some("10G"));
        assert_eq!(opts.pool.as_deref(), Some("rancher"));
        assert!(opts.fs_type.is_none());

        let err = CreateOptions::from_map(&HashMap::from([(
            "replicas".to_owned(),
            "3".to_owned(),
        )]))
        .unwrap_err();
        assert!(matches!(err, VolumeError::Config(_)));
    }

    #[test]
    fn record_reset_clears_attachment() {
        let spec = VolumeSpec {
            pool: "rancher".into(),
            size_bytes: 1 << 30,
            fs_type: "ext4".into(),
        };
        let mut vol = Volume::new("data1", &spec, true);
        vol.state = VolumeState::Mounted;
        vol.device = Some("/dev/rbd0".into());
        vol.mount_point = Some("/mnt/data1".into());
        vol.reset();
        assert_eq!(vol.state, VolumeState::Registered);
        assert!(vol.device.is_none() && vol.mount_point.is_none() && vol.lock.is_none());
        assert_eq!(vol.spec(), spec);
    }

    #[test]
    fn volume_serde_roundtrip() {
        let json = r#"{"name":"v","pool":"p","image":"v","size_bytes":1,"fs_type":"ext4","state":"mapped","device":"/dev/rbd3"}"#;
        let vol: Volume = serde_json::from_str(json).unwrap();
        assert_eq!(vol.state, VolumeState::Mapped);
        assert_eq!(vol.device, Some(PathBuf::from("/dev/rbd3")));
        assert!(vol.mount_point.is_none());
        assert!(!vol.fresh);
    }
}

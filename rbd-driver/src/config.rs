//! Driver configuration resolution for the CLI.
//!
//! Environment variables:
//! - `RBD_DRIVER_ROOT`: scratch root for records and mount points. Defaults to
//!   `/var/lib/rancher/convoy/rbd`.
//! - `RBD_DRIVER_CONFIG`: YAML configuration file. When set (or passed with
//!   `--config`), driver options given with `-o` are applied on top of it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use librbd::DriverConfig;

pub const DEFAULT_ROOT: &str = "/var/lib/rancher/convoy/rbd";

/// Settings read from the environment at first access.
pub struct EnvConfig {
    pub root: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
}

pub static ENV_CONFIG: LazyLock<EnvConfig> = LazyLock::new(|| EnvConfig {
    root: std::env::var_os("RBD_DRIVER_ROOT").map(PathBuf::from),
    config_file: std::env::var_os("RBD_DRIVER_CONFIG").map(PathBuf::from),
});

/// Split `key=value` driver options.
pub fn parse_opts(opts: &[String]) -> Result<HashMap<String, String>> {
    opts.iter()
        .map(|opt| match opt.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_owned(), v.to_owned())),
            _ => bail!("driver option {opt:?} is not in key=value form"),
        })
        .collect()
}

/// Build the driver configuration from the command line, falling back to the
/// environment and then to the defaults.
pub fn resolve(
    root: Option<&Path>,
    config_file: Option<&Path>,
    opts: &[String],
) -> Result<DriverConfig> {
    let root = root
        .map(Path::to_path_buf)
        .or_else(|| ENV_CONFIG.root.clone());
    let config_file = config_file
        .map(Path::to_path_buf)
        .or_else(|| ENV_CONFIG.config_file.clone());
    let opts = parse_opts(opts)?;

    let Some(file) = config_file else {
        let root = root.unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        return DriverConfig::from_map(root, &opts).context("invalid driver options");
    };

    let mut base = DriverConfig::from_yaml_file(&file)
        .with_context(|| format!("failed to load {}", file.display()))?;
    if let Some(root) = root {
        base.root = root;
    }
    if opts.is_empty() {
        base.validate().context("invalid configuration")?;
        return Ok(base);
    }

    // Options override the file: fold the file back into the flat map.
    let mut merged = to_map(&base);
    merged.extend(opts);
    DriverConfig::from_map(base.root.clone(), &merged).context("invalid driver options")
}

fn to_map(cfg: &DriverConfig) -> HashMap<String, String> {
    use librbd::config::*;

    let mut map = HashMap::from([
        (CEPH_CLUSTER.to_owned(), cfg.cluster.clone()),
        (CEPH_SERVERS.to_owned(), cfg.servers.join(",")),
        (CEPH_DEFAULT_USER.to_owned(), cfg.user.clone()),
        (CEPH_DEFAULT_VOLUME_POOL.to_owned(), cfg.default_pool.clone()),
        (CEPH_DEFAULT_VOLUME_SIZE.to_owned(), cfg.default_volume_size.clone()),
        (RBD_FS_TYPE.to_owned(), cfg.default_fs_type.clone()),
        (RBD_DEVICE_PREFIX.to_owned(), cfg.device_prefix.clone()),
        (RBD_TIMEOUT.to_owned(), cfg.timeout_secs.to_string()),
        (RBD_FORMAT_TIMEOUT.to_owned(), cfg.format_timeout_secs.to_string()),
    ]);
    if let Some(secret) = &cfg.secret {
        map.insert(CEPH_SECRET.to_owned(), secret.clone());
    }
    if let Some(conf) = &cfg.ceph_conf {
        map.insert(CEPH_CONF.to_owned(), conf.display().to_string());
    }
    if let Some(host) = &cfg.host_id {
        map.insert(RBD_HOST_ID.to_owned(), host.clone());
    }
    map
}

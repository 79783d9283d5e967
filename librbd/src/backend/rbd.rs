//! Backend driving the Ceph command line tools.
//!
//! Every call shells out through a [`CommandRunner`]. Cluster options
//! (`--cluster`, `--id`, `-c`, `-m`) are passed on the command line; the
//! cephx secret is passed through `CEPH_ARGS` so it never shows up in argv or
//! in logs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Backend, ClusterSpec, PoolContext, Session};
use crate::error::VolumeError;
use crate::exec::{Cmd, CommandOutput, CommandRunner};
use crate::types::{HolderId, LockToken, Locker, MappedDevice};

/// `rbd` exits with `ENOENT` when an image does not exist.
const EXIT_ENOENT: i32 = 2;
const MIB: u64 = 1024 * 1024;

/// [`Backend`] for a real Ceph cluster.
#[derive(Clone)]
pub struct RbdBackend {
    runner: Arc<dyn CommandRunner>,
}

impl RbdBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Backend for RbdBackend {
    async fn connect(&self, spec: &ClusterSpec) -> Result<Arc<dyn Session>, VolumeError> {
        let session = RbdSession {
            runner: Arc::clone(&self.runner),
            spec: spec.clone(),
        };
        let pools = session.list_pools().await?;
        debug!(cluster = %spec.cluster, user = %spec.user, pools = pools.len(), "connected to ceph cluster");
        Ok(Arc::new(session))
    }
}

struct RbdSession {
    runner: Arc<dyn CommandRunner>,
    spec: ClusterSpec,
}

impl RbdSession {
    /// `program` with the cluster connection options.
    fn cmd(&self, program: &str) -> Cmd {
        let mut cmd = Cmd::new(program).args([
            "--cluster".to_owned(),
            self.spec.cluster.clone(),
            "--id".to_owned(),
            self.spec.user.clone(),
            "-c".to_owned(),
            self.spec.conf.display().to_string(),
        ]);
        if !self.spec.servers.is_empty() {
            cmd = cmd.arg("-m").arg(self.spec.servers.join(","));
        }
        if let Some(secret) = &self.spec.secret {
            cmd = cmd.env("CEPH_ARGS", format!("--key {secret}"));
        }
        cmd
    }

    fn image_cmd(&self, sub: &[&str], pool: &PoolContext, image: &str) -> Cmd {
        self.cmd("rbd")
            .args(sub.iter().copied())
            .args(["--pool", pool.pool.as_str(), "--image", image])
    }

    /// Run `cmd`; a spawn failure is a backend error.
    async fn run(&self, cmd: &Cmd) -> Result<CommandOutput, VolumeError> {
        self.runner
            .run(cmd)
            .await
            .map_err(|e| VolumeError::Backend(format!("{}: {e}", cmd.program)))
    }

    /// Run `cmd` and require success.
    async fn check(&self, cmd: &Cmd) -> Result<CommandOutput, VolumeError> {
        let out = self.run(cmd).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(VolumeError::Backend(format!("{cmd}: {}", out.reason())))
        }
    }

    async fn list_pools(&self) -> Result<Vec<String>, VolumeError> {
        let out = self.check(&self.cmd("rados").arg("lspools")).await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LockList {
    List(Vec<LockEntry>),
    /// Pre-Nautilus output: an object keyed by lock id.
    Legacy(BTreeMap<String, LegacyLockEntry>),
}

#[derive(Deserialize)]
struct LockEntry {
    id: String,
    locker: String,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Deserialize)]
struct LegacyLockEntry {
    locker: String,
    #[serde(default)]
    address: Option<String>,
}

fn parse_lockers(json: &str) -> Result<Vec<Locker>, VolumeError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let list: LockList = serde_json::from_str(json)
        .map_err(|e| VolumeError::Backend(format!("parse rbd lock ls output: {e}")))?;
    Ok(match list {
        LockList::List(entries) => entries
            .into_iter()
            .map(|e| Locker {
                token: LockToken {
                    lock_id: e.id,
                    locker: e.locker,
                },
                address: e.address,
            })
            .collect(),
        LockList::Legacy(entries) => entries
            .into_iter()
            .map(|(id, e)| Locker {
                token: LockToken {
                    lock_id: id,
                    locker: e.locker,
                },
                address: e.address,
            })
            .collect(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MappedList {
    List(Vec<MappedEntry>),
    /// Pre-Nautilus output: an object keyed by device id.
    Legacy(BTreeMap<String, MappedEntry>),
}

#[derive(Deserialize)]
struct MappedEntry {
    pool: String,
    name: String,
    device: PathBuf,
}

fn parse_mapped(json: &str) -> Result<Vec<MappedDevice>, VolumeError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let list: MappedList = serde_json::from_str(json)
        .map_err(|e| VolumeError::Backend(format!("parse rbd showmapped output: {e}")))?;
    let entries = match list {
        MappedList::List(entries) => entries,
        MappedList::Legacy(entries) => entries.into_values().collect(),
    };
    Ok(entries
        .into_iter()
        .map(|e| MappedDevice {
            pool: e.pool,
            image: e.name,
            device: e.device,
        })
        .collect())
}

#[async_trait]
impl Session for RbdSession {
    async fn open_pool(&self, pool: &str) -> Result<PoolContext, VolumeError> {
        if self.list_pools().await?.iter().any(|p| p == pool) {
            Ok(PoolContext {
                pool: pool.to_owned(),
            })
        } else {
            Err(VolumeError::Config(format!("pool {pool} does not exist")))
        }
    }

    async fn image_exists(&self, pool: &PoolContext, image: &str) -> Result<bool, VolumeError> {
        let cmd = self
            .image_cmd(&["info"], pool, image)
            .args(["--format", "json"]);
        let out = self.run(&cmd).await?;
        match out.code {
            0 => Ok(true),
            EXIT_ENOENT => Ok(false),
            _ => Err(VolumeError::Backend(format!("{cmd}: {}", out.reason()))),
        }
    }

    async fn create_image(
        &self,
        pool: &PoolContext,
        image: &str,
        size_bytes: u64,
    ) -> Result<(), VolumeError> {
        let size_mib = size_bytes.div_ceil(MIB).max(1);
        let cmd = self
            .image_cmd(&["create"], pool, image)
            .args(["--size".to_owned(), size_mib.to_string()]);
        self.check(&cmd).await.map(|_| ())
    }

    async fn lockers(&self, pool: &PoolContext, image: &str) -> Result<Vec<Locker>, VolumeError> {
        let cmd = self
            .image_cmd(&["lock", "ls"], pool, image)
            .args(["--format", "json"]);
        let out = self.check(&cmd).await?;
        parse_lockers(&out.stdout)
    }

    async fn lock_image(
        &self,
        pool: &PoolContext,
        image: &str,
        holder: &HolderId,
    ) -> Result<LockToken, VolumeError> {
        let lock_id = holder.lock_id();
        let conflict = |lockers: &[Locker]| -> Result<Option<LockToken>, VolumeError> {
            match lockers.first() {
                None => Ok(None),
                Some(l) if l.token.lock_id == lock_id => Ok(Some(l.token.clone())),
                Some(l) => Err(VolumeError::LockConflict {
                    name: image.to_owned(),
                    holder: l.token.lock_id.clone(),
                }),
            }
        };

        if let Some(token) = conflict(&self.lockers(pool, image).await?)? {
            return Ok(token);
        }

        let add = self
            .image_cmd(&["lock", "add"], pool, image)
            .arg(lock_id.clone());
        let out = self.run(&add).await?;

        // Either way the lock list tells who won.
        let lockers = self.lockers(pool, image).await?;
        match conflict(&lockers)? {
            Some(token) => Ok(token),
            None => Err(VolumeError::Backend(format!("{add}: {}", out.reason()))),
        }
    }

    async fn unlock_image(
        &self,
        pool: &PoolContext,
        image: &str,
        token: &LockToken,
    ) -> Result<(), VolumeError> {
        let rm = self
            .image_cmd(&["lock", "rm"], pool, image)
            .args([token.lock_id.as_str(), token.locker.as_str()]);
        let out = self.run(&rm).await?;
        if out.success() {
            return Ok(());
        }
        if self
            .lockers(pool, image)
            .await?
            .iter()
            .all(|l| &l.token != token)
        {
            warn!(%image, %token, "lock already gone");
            return Ok(());
        }
        Err(VolumeError::Backend(format!("{rm}: {}", out.reason())))
    }

    async fn map_image(&self, pool: &PoolContext, image: &str) -> Result<PathBuf, VolumeError> {
        let cmd = self.image_cmd(&["map"], pool, image);
        let out = self.run(&cmd).await?;
        if !out.success() {
            return Err(VolumeError::device(image, out.reason()));
        }
        match out.stdout.lines().last().map(str::trim) {
            Some(dev) if dev.starts_with(self.spec.device_prefix.as_str()) => Ok(PathBuf::from(dev)),
            _ => Err(VolumeError::device(
                image,
                format!(
                    "rbd map printed no {}* device: {:?}",
                    self.spec.device_prefix, out.stdout
                ),
            )),
        }
    }

    async fn unmap_image(&self, device: &Path) -> Result<(), VolumeError> {
        let dev = device.display().to_string();
        let out = self.run(&self.cmd("rbd").args(["unmap", dev.as_str()])).await?;
        if out.success() {
            Ok(())
        } else {
            Err(VolumeError::device(&dev, out.reason()))
        }
    }

    async fn mapped_devices(&self) -> Result<Vec<MappedDevice>, VolumeError> {
        let out = self
            .check(&self.cmd("rbd").args(["showmapped", "--format", "json"]))
            .await?;
        parse_mapped(&out.stdout)
    }
}

//! Storage backend client.
//!
//! A [`Backend`] opens [`Session`]s to the storage cluster. The session grants
//! and releases per-image exclusive locks and maps images to local kernel
//! devices. Two implementations are provided:
//!
//! - [`rbd::RbdBackend`] drives the `rados`/`rbd` command line tools.
//! - [`memory::MemoryBackend`] simulates a cluster shared by several hosts
//!   in-process.

pub mod memory;
pub mod rbd;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DriverConfig;
use crate::error::VolumeError;
use crate::types::{HolderId, LockToken, Locker, MappedDevice};

pub use memory::{MemoryBackend, MemoryCluster};
pub use rbd::RbdBackend;

/// Everything needed to reach and authenticate against the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSpec {
    pub cluster: String,
    pub servers: Vec<String>,
    pub user: String,
    pub secret: Option<String>,
    pub conf: PathBuf,
    /// Path prefix of the kernel block devices images are mapped to.
    pub device_prefix: String,
}

impl From<&DriverConfig> for ClusterSpec {
    fn from(cfg: &DriverConfig) -> Self {
        Self {
            cluster: cfg.cluster.clone(),
            servers: cfg.servers.clone(),
            user: cfg.user.clone(),
            secret: cfg.secret.clone(),
            conf: cfg.ceph_conf_path(),
            device_prefix: cfg.device_prefix.clone(),
        }
    }
}

/// An opened pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolContext {
    pub pool: String,
}

/// Connection factory.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open a new session to the cluster.
    async fn connect(&self, spec: &ClusterSpec) -> Result<Arc<dyn Session>, VolumeError>;
}

/// An open connection to the cluster.
///
/// Cluster-side failures are reported as [`VolumeError::Backend`], which makes
/// the caller drop the session and reconnect.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open `pool`. A missing pool is a [`VolumeError::Config`].
    async fn open_pool(&self, pool: &str) -> Result<PoolContext, VolumeError>;

    async fn image_exists(&self, pool: &PoolContext, image: &str) -> Result<bool, VolumeError>;

    async fn create_image(
        &self,
        pool: &PoolContext,
        image: &str,
        size_bytes: u64,
    ) -> Result<(), VolumeError>;

    /// Current exclusive lock holders of `image`.
    async fn lockers(&self, pool: &PoolContext, image: &str) -> Result<Vec<Locker>, VolumeError>;

    /// Take the exclusive lock on `image` for `holder`.
    ///
    /// Returns the existing token if `holder` already owns the lock and fails
    /// with [`VolumeError::LockConflict`] if anyone else does. Never waits.
    async fn lock_image(
        &self,
        pool: &PoolContext,
        image: &str,
        holder: &HolderId,
    ) -> Result<LockToken, VolumeError>;

    /// Release the lock identified by `token`. Unknown tokens are ignored.
    async fn unlock_image(
        &self,
        pool: &PoolContext,
        image: &str,
        token: &LockToken,
    ) -> Result<(), VolumeError>;

    /// Map `image` to a new local kernel device and return its path.
    async fn map_image(&self, pool: &PoolContext, image: &str) -> Result<PathBuf, VolumeError>;

    async fn unmap_image(&self, device: &Path) -> Result<(), VolumeError>;

    /// Devices currently mapped on this host.
    async fn mapped_devices(&self) -> Result<Vec<MappedDevice>, VolumeError>;
}

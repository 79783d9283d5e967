//! Kernel block device mapping.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::cluster::Cluster;
use crate::error::VolumeError;
use crate::lock::LockManager;
use crate::step::Step;
use crate::types::{LockToken, MappedDevice, Volume};

/// Maps locked images to local block devices and back.
pub struct DeviceMapper {
    cluster: Arc<Cluster>,
    locks: Arc<LockManager>,
}

impl DeviceMapper {
    pub fn new(cluster: Arc<Cluster>, locks: Arc<LockManager>) -> Self {
        Self { cluster, locks }
    }

    /// Devices mapped on this host, as the kernel reports them.
    pub async fn mapped_devices(&self) -> Result<Vec<MappedDevice>, VolumeError> {
        self.cluster
            .call(Step::Inspect, "showmapped", |s| async move {
                s.mapped_devices().await
            })
            .await
    }

    /// The device `vol`'s image is currently mapped at, if any.
    pub async fn find(&self, vol: &Volume) -> Result<Option<PathBuf>, VolumeError> {
        Ok(self
            .mapped_devices()
            .await?
            .into_iter()
            .find(|m| m.pool == vol.pool && m.image == vol.image)
            .map(|m| m.device))
    }

    /// Map `vol` while holding `token`.
    ///
    /// Returns the recorded device unchanged when the kernel confirms it is
    /// still mapped to this image. On failure the lock is released before
    /// the error is returned.
    #[instrument(skip(self, vol, token), fields(volume = %vol.name))]
    pub async fn map(&self, vol: &Volume, token: &LockToken) -> Result<PathBuf, VolumeError> {
        if let Some(recorded) = &vol.device {
            if self.find(vol).await?.as_ref() == Some(recorded) {
                debug!(device = %recorded.display(), "already mapped");
                return Ok(recorded.clone());
            }
        }

        let mapped = self
            .cluster
            .call(Step::Map, &vol.name, |s| async move {
                let pool = s.open_pool(&vol.pool).await?;
                s.map_image(&pool, &vol.image).await
            })
            .await;

        match mapped {
            Ok(device) => {
                info!(device = %device.display(), "image mapped");
                Ok(device)
            }
            Err(e) => {
                if let Err(release) = self.locks.release(vol, token).await {
                    warn!(error = %release, "failed to release lock after map failure");
                }
                Err(match e {
                    VolumeError::Backend(reason) => VolumeError::device(&vol.name, reason),
                    other => other,
                })
            }
        }
    }

    /// Unmap `vol`'s device. A volume that is still mounted cannot be
    /// unmapped.
    #[instrument(skip(self, vol), fields(volume = %vol.name))]
    pub async fn unmap(&self, vol: &Volume) -> Result<(), VolumeError> {
        if let Some(mount_point) = &vol.mount_point {
            return Err(VolumeError::busy(
                &vol.name,
                format!("still mounted at {}", mount_point.display()),
            ));
        }
        let Some(device) = vol.device.clone() else {
            debug!("no device recorded, nothing to unmap");
            return Ok(());
        };

        let unmapped = self
            .cluster
            .call(Step::Unmap, &vol.name, |s| {
                let device = device.clone();
                async move { s.unmap_image(&device).await }
            })
            .await;

        match unmapped {
            Ok(()) => {
                info!(device = %device.display(), "image unmapped");
                Ok(())
            }
            Err(e) => match self.find(vol).await {
                Ok(None) => {
                    warn!(device = %device.display(), error = %e, "unmap failed but device is gone");
                    Ok(())
                }
                _ => Err(match e {
                    VolumeError::Backend(reason) => VolumeError::device(&vol.name, reason),
                    other => other,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::{ClusterSpec, MemoryBackend, MemoryCluster};
    use crate::types::{HolderId, VolumeSpec, VolumeState};

    struct Setup {
        mem: MemoryCluster,
        host: MemoryBackend,
        locks: Arc<LockManager>,
        devices: DeviceMapper,
        vol: Volume,
    }

    async fn setup() -> Setup {
        let mem = MemoryCluster::with_pools(&["rancher"]);
        let host = mem.host();
        let spec = ClusterSpec {
            cluster: "ceph".into(),
            servers: Vec::new(),
            user: "admin".into(),
            secret: None,
            conf: "/etc/ceph/ceph.conf".into(),
            device_prefix: "/dev/rbd".into(),
        };
        let cluster = Arc::new(Cluster::new(
            Arc::new(host.clone()),
            spec,
            Duration::from_secs(5),
        ));
        cluster
            .call(Step::CreateImage, "data1", |s| async move {
                let pool = s.open_pool("rancher").await?;
                s.create_image(&pool, "data1", 1 << 30).await
            })
            .await
            .unwrap();
        let locks = Arc::new(LockManager::new(
            Arc::clone(&cluster),
            HolderId::new("node-a", 1),
        ));
        let devices = DeviceMapper::new(cluster, Arc::clone(&locks));
        let vol = Volume::new(
            "data1",
            &VolumeSpec {
                pool: "rancher".into(),
                size_bytes: 1 << 30,
                fs_type: "ext4".into(),
            },
            true,
        );
        Setup {
            mem,
            host,
            locks,
            devices,
            vol,
        }
    }

    #[tokio::test]
    async fn map_is_idempotent_for_recorded_device() {
        let mut s = setup().await;
        let token = s.locks.acquire(&s.vol).await.unwrap();
        let device = s.devices.map(&s.vol, &token).await.unwrap();
        assert_eq!(device, PathBuf::from("/dev/rbd0"));

        s.vol.device = Some(device.clone());
        s.vol.state = VolumeState::Mapped;
        assert_eq!(s.devices.map(&s.vol, &token).await.unwrap(), device);
        assert_eq!(s.host.mapped().len(), 1);
    }

    #[tokio::test]
    async fn map_failure_releases_lock() {
        let s = setup().await;
        let token = s.locks.acquire(&s.vol).await.unwrap();
        s.host.fail_next_map("rbd: sysfs write failed");
        let err = s.devices.map(&s.vol, &token).await.unwrap_err();
        assert!(matches!(err, VolumeError::Device { .. }));
        assert!(s.mem.lockers("rancher", "data1").is_empty());
    }

    #[tokio::test]
    async fn unmap_refuses_mounted_and_tolerates_missing() {
        let mut s = setup().await;
        let token = s.locks.acquire(&s.vol).await.unwrap();
        s.vol.device = Some(s.devices.map(&s.vol, &token).await.unwrap());

        s.vol.mount_point = Some("/mnt/data1".into());
        assert!(matches!(s.devices.unmap(&s.vol).await, Err(VolumeError::Busy { .. })));

        s.vol.mount_point = None;
        s.devices.unmap(&s.vol).await.unwrap();
        assert!(s.host.mapped().is_empty());
        // Device already gone.
        s.devices.unmap(&s.vol).await.unwrap();
    }
}

//! The volume driver façade.
//!
//! [`VolumeDriver`] owns one instance of every component and exposes the
//! operations container hosts call: `create`, `mount`, `path`, `unmount`,
//! `remove`, `get`, `list`, plus `name`, `info`, `capabilities` and `clear`.
//!
//! Attach walks Lock → Map → Mount and commits every step to the registry.
//! When a step fails, the steps completed by the same call are undone in
//! reverse and the record is returned to where the call found it. Teardown
//! attempts Unmount → Unmap → Release even after a failure and reports the
//! first hard failure.

mod reconcile;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, ClusterSpec};
use crate::cluster::Cluster;
use crate::config::{DRIVER_NAME, DriverConfig, validate_fs_type};
use crate::device::DeviceMapper;
use crate::error::VolumeError;
use crate::exec::CommandRunner;
use crate::lock::LockManager;
use crate::mount::MountManager;
use crate::registry::{Lease, Registry, Reserve};
use crate::step::Step;
use crate::types::{
    Capabilities, CreateOptions, HolderId, Volume, VolumeSpec, VolumeState, parse_size,
    validate_name,
};

/// An exclusive-attach RBD volume driver for one host.
pub struct VolumeDriver {
    config: Arc<DriverConfig>,
    registry: Registry,
    cluster: Arc<Cluster>,
    locks: Arc<LockManager>,
    devices: DeviceMapper,
    mounts: MountManager,
}

impl VolumeDriver {
    /// Open the driver: load the registry under `config.root` and reconcile
    /// every record against the kernel and the cluster.
    ///
    /// An unreachable cluster does not fail the open; records that cannot be
    /// verified are marked [`VolumeState::Inconsistent`] instead.
    #[instrument(skip_all, fields(root = %config.root.display()))]
    pub async fn open(
        config: DriverConfig,
        backend: Arc<dyn Backend>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, VolumeError> {
        config.validate()?;
        let config = Arc::new(config);

        tokio::fs::create_dir_all(config.mounts_dir())
            .await
            .map_err(|e| {
                VolumeError::Storage(format!("create {}: {e}", config.mounts_dir().display()))
            })?;
        let registry = Registry::open(config.volumes_dir()).await?;

        let holder = HolderId::local(config.host_id.as_deref())?;
        let cluster = Arc::new(Cluster::new(
            backend,
            ClusterSpec::from(config.as_ref()),
            config.step_timeout(),
        ));
        let locks = Arc::new(LockManager::new(Arc::clone(&cluster), holder));
        let devices = DeviceMapper::new(Arc::clone(&cluster), Arc::clone(&locks));
        let mounts = MountManager::new(runner, Arc::clone(&config));

        let driver = Self {
            config,
            registry,
            cluster,
            locks,
            devices,
            mounts,
        };
        driver.reconcile_all().await;
        info!(holder = %driver.locks.holder(), volumes = driver.registry.list().len(), "driver ready");
        Ok(driver)
    }

    pub fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Driver settings with the secret masked.
    pub fn info(&self) -> HashMap<String, String> {
        let mut info = self.config.info();
        info.insert("HostId".to_owned(), self.locks.holder().to_string());
        info
    }

    /// Snapshot and backup are not supported.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            snapshot: false,
            backup: false,
        }
    }

    /// Resolve `opts` against the configured defaults.
    fn resolve(&self, opts: &CreateOptions) -> Result<VolumeSpec, VolumeError> {
        let pool = opts
            .pool
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.config.default_pool.clone());
        let size_bytes = match &opts.size {
            Some(size) => parse_size(size)?,
            None => self.config.default_size_bytes()?,
        };
        let fs_type = opts
            .fs_type
            .clone()
            .unwrap_or_else(|| self.config.default_fs_type.clone());
        validate_fs_type(&fs_type)?;
        Ok(VolumeSpec {
            pool,
            size_bytes,
            fs_type,
        })
    }

    /// Register `name`, creating its backing image if it does not exist.
    ///
    /// Repeating a create with the same resolved options returns the existing
    /// record; different options fail with [`VolumeError::AlreadyExists`].
    #[instrument(skip(self, opts))]
    pub async fn create(&self, name: &str, opts: &CreateOptions) -> Result<Volume, VolumeError> {
        validate_name(name)?;
        let spec = self.resolve(opts)?;

        let reservation = match self.registry.reserve(name)? {
            Reserve::Existing(existing) => {
                if existing.state == VolumeState::Inconsistent {
                    return Err(VolumeError::Inconsistent(name.to_owned()));
                }
                if existing.spec() == spec {
                    debug!("volume already registered with the same options");
                    return Ok(existing);
                }
                return Err(VolumeError::AlreadyExists(name.to_owned()));
            }
            Reserve::New(reservation) => reservation,
        };

        let pool = spec.pool.as_str();
        let exists = self
            .cluster
            .call(Step::Inspect, name, |s| async move {
                let pool = s.open_pool(pool).await?;
                s.image_exists(&pool, name).await
            })
            .await?;

        if exists {
            info!(%pool, "adopting existing image");
        } else {
            let size = spec.size_bytes;
            self.cluster
                .call(Step::CreateImage, name, |s| async move {
                    let pool = s.open_pool(pool).await?;
                    s.create_image(&pool, name, size).await
                })
                .await?;
            info!(%pool, size, "image created");
        }

        reservation.commit(Volume::new(name, &spec, !exists)).await
    }

    /// Attach `name` and return its mount point.
    #[instrument(skip(self))]
    pub async fn mount(&self, name: &str) -> Result<PathBuf, VolumeError> {
        let mut lease = self.registry.claim(name, "mount")?;
        if lease.volume().state == VolumeState::Inconsistent {
            return Err(VolumeError::Inconsistent(name.to_owned()));
        }
        if let Err(e) = lease.flush().await {
            warn!(error = %e, "failed to write out pending record");
        }
        if lease.volume().state == VolumeState::Mounted {
            if let Some(path) = self.confirm_mounted(lease.volume()).await? {
                debug!(path = %path.display(), "already mounted");
                return Ok(path);
            }
            warn!("recorded mount is gone, re-checking the volume");
            let mapped = self.devices.mapped_devices().await?;
            let next = self.reconcile(lease.volume(), Some(&mapped)).await;
            if &next != lease.volume() {
                lease.commit(next).await?;
            }
            if lease.volume().state == VolumeState::Inconsistent {
                return Err(VolumeError::Inconsistent(name.to_owned()));
            }
        }
        let start = lease.volume().clone();

        match self.attach(&mut lease).await {
            Ok(path) => Ok(path),
            Err(e) => {
                warn!(error = %e, "attach failed, rolling back");
                self.rollback(&mut lease, &start).await;
                Err(e)
            }
        }
    }

    /// The recorded mount point of `vol` if the kernel still shows its
    /// device mounted there.
    async fn confirm_mounted(&self, vol: &Volume) -> Result<Option<PathBuf>, VolumeError> {
        let (Some(path), Some(device)) = (&vol.mount_point, &vol.device) else {
            return Ok(None);
        };
        let source = self.mounts.mounted_source(path).await?;
        Ok((source.as_ref() == Some(device)).then(|| path.clone()))
    }

    async fn attach(&self, lease: &mut Lease<'_>) -> Result<PathBuf, VolumeError> {
        let mut vol = lease.volume().clone();

        let token = match vol.lock.clone() {
            Some(token) if vol.state >= VolumeState::Locked => token,
            _ => {
                let token = self.locks.acquire(&vol).await?;
                vol.state = VolumeState::Locked;
                vol.lock = Some(token.clone());
                lease.commit(vol.clone()).await?;
                token
            }
        };

        let device = match vol.device.clone() {
            Some(device) if vol.state >= VolumeState::Mapped => device,
            _ => {
                let device = match self.devices.map(&vol, &token).await {
                    Ok(device) => device,
                    Err(e) => {
                        // The mapper gave the lock up.
                        vol.lock = None;
                        vol.state = VolumeState::Registered;
                        record(lease, &vol).await;
                        return Err(e);
                    }
                };
                vol.state = VolumeState::Mapped;
                vol.device = Some(device.clone());
                lease.commit(vol.clone()).await?;
                device
            }
        };

        let mounted = self.mounts.mount(&vol, &device).await?;
        vol.state = VolumeState::Mounted;
        vol.mount_point = Some(mounted.path.clone());
        vol.fresh = false;
        lease.commit(vol).await?;
        Ok(mounted.path)
    }

    /// Undo what a failed attach did, down to `start`. Failures are logged;
    /// the record keeps whatever could not be undone.
    async fn rollback(&self, lease: &mut Lease<'_>, start: &Volume) {
        let mut vol = lease.volume().clone();

        if start.state < VolumeState::Mounted && vol.device.is_some() {
            let mount_point = self.config.mount_point(&vol.name);
            match self.mounts.mounted_source(&mount_point).await {
                Ok(Some(_)) => {
                    let mut mounted = vol.clone();
                    mounted.mount_point = Some(mount_point);
                    if let Err(e) = self.mounts.unmount(&mounted).await {
                        warn!(error = %e, "rollback: unmount failed");
                        vol.state = VolumeState::Mounted;
                        vol.mount_point = mounted.mount_point;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "rollback: cannot inspect mount point"),
            }
        }

        if start.state < VolumeState::Mapped
            && vol.state < VolumeState::Mounted
            && vol.device.is_some()
        {
            match self.devices.unmap(&vol).await {
                Ok(()) => {
                    vol.device = None;
                    vol.state = VolumeState::Locked;
                }
                Err(e) => warn!(error = %e, "rollback: unmap failed"),
            }
        }

        if start.state < VolumeState::Locked && vol.device.is_none() {
            let token = match vol.lock.clone() {
                Some(token) => Some(token),
                // A timed-out lock step may still have taken the lock.
                None => self.locks.held(&vol).await.unwrap_or_else(|e| {
                    warn!(error = %e, "rollback: cannot look up lock");
                    None
                }),
            };
            if let Some(token) = token {
                match self.locks.release(&vol, &token).await {
                    Ok(()) => {
                        vol.lock = None;
                        vol.state = VolumeState::Registered;
                    }
                    Err(e) => warn!(error = %e, "rollback: lock release failed"),
                }
            }
        }

        if &vol != lease.volume() {
            if let Err(e) = lease.commit(vol).await {
                warn!(error = %e, "rollback: failed to record state");
            }
        }
    }

    /// Mount point of `name`, `None` if it is not mounted.
    pub fn path(&self, name: &str) -> Result<Option<PathBuf>, VolumeError> {
        let vol = self.get(name)?;
        match vol.state {
            VolumeState::Inconsistent => Err(VolumeError::Inconsistent(name.to_owned())),
            VolumeState::Mounted => Ok(vol.mount_point),
            _ => Ok(None),
        }
    }

    /// Detach `name` completely: unmount, unmap and release the lock.
    #[instrument(skip(self))]
    pub async fn unmount(&self, name: &str) -> Result<(), VolumeError> {
        let mut lease = self.registry.claim(name, "unmount")?;
        if lease.volume().state == VolumeState::Inconsistent {
            return Err(VolumeError::Inconsistent(name.to_owned()));
        }
        if let Err(e) = lease.flush().await {
            warn!(error = %e, "failed to write out pending record");
        }
        self.teardown(&mut lease).await
    }

    async fn teardown(&self, lease: &mut Lease<'_>) -> Result<(), VolumeError> {
        let mut vol = lease.volume().clone();
        let mut failure: Option<VolumeError> = None;

        if vol.state == VolumeState::Mounted || vol.mount_point.is_some() {
            match self.mounts.unmount(&vol).await {
                Ok(()) => {
                    vol.mount_point = None;
                    vol.state = VolumeState::Mapped;
                    record(lease, &vol).await;
                }
                Err(e) => failure = Some(e),
            }
        }

        if vol.device.is_some() {
            match self.devices.unmap(&vol).await {
                Ok(()) => {
                    vol.device = None;
                    vol.state = VolumeState::Locked;
                    record(lease, &vol).await;
                }
                Err(e) => note(&mut failure, e),
            }
        }

        if let Some(token) = vol.lock.clone() {
            if vol.device.is_some() {
                note(
                    &mut failure,
                    VolumeError::busy(&vol.name, "device is still mapped"),
                );
            } else {
                match self.locks.release(&vol, &token).await {
                    Ok(()) => {
                        vol.lock = None;
                        vol.state = VolumeState::Registered;
                        record(lease, &vol).await;
                    }
                    Err(e) => note(&mut failure, e),
                }
            }
        } else if vol.state == VolumeState::Locked {
            vol.state = VolumeState::Registered;
            record(lease, &vol).await;
        }

        match failure {
            Some(e) => Err(e),
            None => {
                info!("volume detached");
                Ok(())
            }
        }
    }

    /// Forget `name`. The volume must be fully detached.
    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> Result<(), VolumeError> {
        if self.get(name)?.state == VolumeState::Inconsistent {
            return Err(VolumeError::Inconsistent(name.to_owned()));
        }
        self.registry.delete(name).await?;
        info!("volume removed");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Volume, VolumeError> {
        self.registry
            .get(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_owned()))
    }

    pub fn list(&self) -> Vec<Volume> {
        self.registry.list()
    }

    /// Re-run reconciliation for `name` against the current kernel and
    /// cluster state. This is how an `Inconsistent` record is resolved once
    /// the cause is fixed.
    #[instrument(skip(self))]
    pub async fn clear(&self, name: &str) -> Result<Volume, VolumeError> {
        let mut lease = self.registry.claim(name, "clear")?;
        let mapped = self.devices.mapped_devices().await.ok();
        let next = self.reconcile(lease.volume(), mapped.as_deref()).await;
        if &next != lease.volume() {
            info!(from = %lease.volume().state, to = %next.state, "record reconciled");
            lease.commit(next.clone()).await?;
        }
        if next.state == VolumeState::Inconsistent {
            return Err(VolumeError::Inconsistent(name.to_owned()));
        }
        Ok(next)
    }
}

/// Persist a teardown step. The step itself already happened, so when the
/// write fails the record is still published in memory and only the error is
/// logged.
async fn record(lease: &mut Lease<'_>, vol: &Volume) {
    if let Err(e) = lease.commit(vol.clone()).await {
        warn!(volume = %vol.name, state = %vol.state, error = %e, "failed to record teardown step");
        lease.publish(vol.clone());
    }
}

/// Keep the first hard failure. A `Busy` caused by an earlier failed step is
/// only logged.
fn note(failure: &mut Option<VolumeError>, e: VolumeError) {
    match failure {
        Some(first) => {
            debug!(error = %e, first = %first, "teardown step skipped after earlier failure");
        }
        None => *failure = Some(e),
    }
}

//! Startup reconciliation of persisted records against the host.

use std::path::PathBuf;

use tracing::{info, warn};

use super::VolumeDriver;
use crate::types::{MappedDevice, Volume, VolumeState};

impl VolumeDriver {
    /// Bring every record in line with what the kernel and the cluster
    /// report. Failures never abort the open; they end up as
    /// `Inconsistent` records.
    pub(super) async fn reconcile_all(&self) {
        let mapped = match self.devices.mapped_devices().await {
            Ok(mapped) => Some(mapped),
            Err(e) => {
                warn!(error = %e, "cannot list mapped devices, attached volumes will be unverifiable");
                None
            }
        };

        for vol in self.registry.list() {
            let next = self.reconcile(&vol, mapped.as_deref()).await;
            if next == vol {
                continue;
            }
            info!(volume = %vol.name, from = %vol.state, to = %next.state, "record reconciled");
            if let Err(e) = self.registry.put(next).await {
                warn!(volume = %vol.name, error = %e, "failed to persist reconciled record");
            }
        }
    }

    /// The record `vol` should have given the devices currently `mapped` on
    /// this host (`None` when they could not be listed).
    pub(super) async fn reconcile(&self, vol: &Volume, mapped: Option<&[MappedDevice]>) -> Volume {
        let attached = vol.device.is_some()
            || matches!(
                vol.state,
                VolumeState::Mapped | VolumeState::Mounted | VolumeState::Inconsistent
            );
        if !attached && vol.state != VolumeState::Locked {
            return vol.clone();
        }

        let Some(mapped) = mapped else {
            return inconsistent(vol);
        };
        let device = mapped
            .iter()
            .find(|m| m.pool == vol.pool && m.image == vol.image)
            .map(|m| m.device.clone());

        match device {
            Some(device) => self.adopt(vol, device).await,
            None if attached => self.detach_lost(vol).await,
            None => match self.locks.verify(vol).await {
                Ok(true) => vol.clone(),
                Ok(false) => {
                    warn!(volume = %vol.name, "recorded lock is gone");
                    let mut next = vol.clone();
                    next.reset();
                    next
                }
                Err(e) => {
                    warn!(volume = %vol.name, error = %e, "cannot verify lock");
                    inconsistent(vol)
                }
            },
        }
    }

    /// The image is mapped at `device`: keep it if this host still owns the
    /// lock.
    async fn adopt(&self, vol: &Volume, device: PathBuf) -> Volume {
        let token = match self.locks.held(vol).await {
            Ok(Some(token)) if vol.lock.as_ref().is_none_or(|recorded| recorded == &token) => token,
            Ok(other) => {
                warn!(volume = %vol.name, holder = ?other, "mapped device without a verifiable lock");
                let mut next = inconsistent(vol);
                next.device = Some(device);
                return next;
            }
            Err(e) => {
                warn!(volume = %vol.name, error = %e, "cannot verify lock of mapped device");
                let mut next = inconsistent(vol);
                next.device = Some(device);
                return next;
            }
        };

        let mount_point = self.config.mount_point(&vol.name);
        let mounted = match self.mounts.mounted_source(&mount_point).await {
            Ok(source) => source.as_ref() == Some(&device),
            Err(e) => {
                warn!(volume = %vol.name, error = %e, "cannot inspect mount point");
                false
            }
        };

        let mut next = vol.clone();
        next.lock = Some(token);
        next.device = Some(device);
        if mounted {
            next.state = VolumeState::Mounted;
            next.mount_point = Some(mount_point);
        } else {
            next.state = VolumeState::Mapped;
            next.mount_point = None;
        }
        next
    }

    /// The recorded device is gone, e.g. after a reboot. Give the lock back
    /// and start over from `Registered`.
    async fn detach_lost(&self, vol: &Volume) -> Volume {
        if let Some(token) = &vol.lock {
            if let Err(e) = self.locks.release(vol, token).await {
                warn!(volume = %vol.name, error = %e, "failed to release lock of unmapped volume");
            }
        }
        let mut next = vol.clone();
        next.reset();
        next
    }
}

fn inconsistent(vol: &Volume) -> Volume {
    let mut next = vol.clone();
    next.state = VolumeState::Inconsistent;
    next
}

//! Filesystem probing, formatting and mounting.
//!
//! Every tool runs through the [`CommandRunner`] under a step timeout:
//!
//! | Tool | Purpose |
//! |---|---|
//! | `findmnt -n -o SOURCE --mountpoint <mp>` | what is mounted at `mp` |
//! | `blkid -p -o value -s TYPE <dev>` | filesystem on `dev`, exit 2 if none |
//! | `mkfs -t <fs> <dev>` | format a fresh device |
//! | `mount -t <fs> <dev> <mp>` / `umount <mp>` | attach and detach |

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::DriverConfig;
use crate::error::VolumeError;
use crate::exec::{Cmd, CommandOutput, CommandRunner};
use crate::step::{Step, bounded};
use crate::types::Volume;

/// `blkid` exit code when no filesystem signature was found.
const BLKID_NOT_FOUND: i32 = 2;

/// Outcome of [`MountManager::mount`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountResult {
    pub path: PathBuf,
    /// The device was formatted by this call.
    pub formatted: bool,
}

pub struct MountManager {
    runner: Arc<dyn CommandRunner>,
    config: Arc<DriverConfig>,
}

impl MountManager {
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<DriverConfig>) -> Self {
        Self { runner, config }
    }

    async fn run(
        &self,
        step: Step,
        mount_point: &Path,
        cmd: Cmd,
        limit: Duration,
    ) -> Result<CommandOutput, VolumeError> {
        let subject = mount_point.display().to_string();
        bounded(step, &subject, limit, async {
            self.runner
                .run(&cmd)
                .await
                .map_err(|e| VolumeError::mount(mount_point, format!("{}: {e}", cmd.program)))
        })
        .await
    }

    /// Source device mounted at `mount_point`, if any.
    pub async fn mounted_source(&self, mount_point: &Path) -> Result<Option<PathBuf>, VolumeError> {
        let cmd = Cmd::new("findmnt")
            .args(["-n", "-o", "SOURCE", "--mountpoint"])
            .arg(mount_point.display().to_string());
        let out = self
            .run(Step::Mount, mount_point, cmd, self.config.step_timeout())
            .await?;
        match out.code {
            0 if !out.stdout.is_empty() => Ok(Some(PathBuf::from(out.stdout))),
            0 | 1 => Ok(None),
            _ => Err(VolumeError::mount(mount_point, format!("findmnt: {}", out.reason()))),
        }
    }

    /// Filesystem type on `device`, `None` if it carries no filesystem.
    async fn probe(&self, device: &Path, mount_point: &Path) -> Result<Option<String>, VolumeError> {
        let cmd = Cmd::new("blkid")
            .args(["-p", "-o", "value", "-s", "TYPE"])
            .arg(device.display().to_string());
        let out = self
            .run(Step::Mount, mount_point, cmd, self.config.step_timeout())
            .await?;
        match out.code {
            0 if !out.stdout.is_empty() => Ok(Some(out.stdout)),
            0 | BLKID_NOT_FOUND => Ok(None),
            _ => Err(VolumeError::mount(mount_point, format!("blkid: {}", out.reason()))),
        }
    }

    /// Mount `device` at `vol`'s mount point, formatting it first if it is
    /// a fresh image without a filesystem.
    #[instrument(skip(self, vol), fields(volume = %vol.name, device = %device.display()))]
    pub async fn mount(&self, vol: &Volume, device: &Path) -> Result<MountResult, VolumeError> {
        let mount_point = self.config.mount_point(&vol.name);
        tokio::fs::create_dir_all(&mount_point)
            .await
            .map_err(|e| VolumeError::mount(&mount_point, e))?;

        match self.mounted_source(&mount_point).await? {
            Some(source) if source == device => {
                debug!(path = %mount_point.display(), "already mounted");
                return Ok(MountResult {
                    path: mount_point,
                    formatted: false,
                });
            }
            Some(source) => {
                return Err(VolumeError::mount(
                    &mount_point,
                    format!("already mounted from {}", source.display()),
                ));
            }
            None => {}
        }

        let mut formatted = false;
        let fs_type = match self.probe(device, &mount_point).await? {
            Some(found) => {
                if found != vol.fs_type {
                    warn!(expected = %vol.fs_type, %found, "device carries a different filesystem");
                }
                found
            }
            None if vol.fresh => {
                info!(fs_type = %vol.fs_type, "formatting fresh device");
                let mkfs = Cmd::new("mkfs")
                    .args(["-t", vol.fs_type.as_str()])
                    .arg(device.display().to_string());
                let out = self
                    .run(Step::Format, &mount_point, mkfs, self.config.format_timeout())
                    .await?;
                if !out.success() {
                    return Err(VolumeError::mount(&mount_point, format!("mkfs: {}", out.reason())));
                }
                formatted = true;
                vol.fs_type.clone()
            }
            None => {
                return Err(VolumeError::mount(
                    &mount_point,
                    format!(
                        "{} has no filesystem and was not created by this driver",
                        device.display()
                    ),
                ));
            }
        };

        let mount = Cmd::new("mount")
            .args(["-t", fs_type.as_str()])
            .arg(device.display().to_string())
            .arg(mount_point.display().to_string());
        let out = self
            .run(Step::Mount, &mount_point, mount, self.config.step_timeout())
            .await?;
        if !out.success() {
            return Err(VolumeError::mount(&mount_point, format!("mount: {}", out.reason())));
        }

        info!(path = %mount_point.display(), formatted, "volume mounted");
        Ok(MountResult {
            path: mount_point,
            formatted,
        })
    }

    /// Unmount `vol`. Succeeds if the mount point ends up unmounted, even when
    /// `umount` itself fails.
    #[instrument(skip(self, vol), fields(volume = %vol.name))]
    pub async fn unmount(&self, vol: &Volume) -> Result<(), VolumeError> {
        let mount_point = vol
            .mount_point
            .clone()
            .unwrap_or_else(|| self.config.mount_point(&vol.name));

        let umount = Cmd::new("umount").arg(mount_point.display().to_string());
        let out = self
            .run(Step::Unmount, &mount_point, umount, self.config.step_timeout())
            .await?;
        if !out.success() {
            if self.mounted_source(&mount_point).await?.is_some() {
                return Err(VolumeError::mount(&mount_point, format!("umount: {}", out.reason())));
            }
            debug!(path = %mount_point.display(), reason = %out.reason(), "umount failed but target is not mounted");
        }

        match tokio::fs::remove_dir(&mount_point).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %mount_point.display(), error = %e, "failed to remove mount point directory");
            }
        }
        info!(path = %mount_point.display(), "volume unmounted");
        Ok(())
    }
}

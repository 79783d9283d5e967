//! Exclusive backend locks.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::cluster::Cluster;
use crate::error::VolumeError;
use crate::step::Step;
use crate::types::{HolderId, LockToken, Volume};

/// Takes and releases the per-image exclusive lock under this process's
/// [`HolderId`].
pub struct LockManager {
    cluster: Arc<Cluster>,
    holder: HolderId,
}

impl LockManager {
    pub fn new(cluster: Arc<Cluster>, holder: HolderId) -> Self {
        Self { cluster, holder }
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    /// Acquire the lock on `vol`'s image. Never waits for another holder:
    /// a held lock fails immediately with [`VolumeError::LockConflict`].
    ///
    /// A lock left by an earlier process of this host is adopted instead.
    #[instrument(skip(self, vol), fields(volume = %vol.name, holder = %self.holder))]
    pub async fn acquire(&self, vol: &Volume) -> Result<LockToken, VolumeError> {
        let holder = &self.holder;
        let locked = self
            .cluster
            .call(Step::Lock, &vol.name, |s| async move {
                let pool = s.open_pool(&vol.pool).await?;
                s.lock_image(&pool, &vol.image, holder).await
            })
            .await;
        let token = match locked {
            Ok(token) => token,
            Err(VolumeError::LockConflict { holder, .. }) if self.holder.same_host(&holder) => {
                match self.held(vol).await? {
                    Some(token) => {
                        info!(%token, "adopting lock left by an earlier process on this host");
                        return Ok(token);
                    }
                    None => {
                        return Err(VolumeError::LockConflict {
                            name: vol.name.clone(),
                            holder,
                        });
                    }
                }
            }
            Err(VolumeError::LockConflict { holder, .. }) => {
                return Err(VolumeError::LockConflict {
                    name: vol.name.clone(),
                    holder,
                });
            }
            Err(e) => return Err(e),
        };
        info!(%token, "lock acquired");
        Ok(token)
    }

    /// Release `token`. Releasing a lock that is already gone succeeds.
    #[instrument(skip(self, vol), fields(volume = %vol.name))]
    pub async fn release(&self, vol: &Volume, token: &LockToken) -> Result<(), VolumeError> {
        self.cluster
            .call(Step::Unlock, &vol.name, |s| async move {
                let pool = s.open_pool(&vol.pool).await?;
                if !s
                    .lockers(&pool, &vol.image)
                    .await?
                    .iter()
                    .any(|l| &l.token == token)
                {
                    warn!(%token, "lock not held, nothing to release");
                    return Ok(());
                }
                s.unlock_image(&pool, &vol.image, token).await
            })
            .await?;
        info!(%token, "lock released");
        Ok(())
    }

    /// Whether the lock recorded on `vol` is still held by this host.
    ///
    /// The pid part of the lock id is not compared: after a restart the lock
    /// was taken by a previous process of the same host.
    pub async fn verify(&self, vol: &Volume) -> Result<bool, VolumeError> {
        let lockers = self
            .cluster
            .call(Step::Inspect, &vol.name, |s| async move {
                let pool = s.open_pool(&vol.pool).await?;
                s.lockers(&pool, &vol.image).await
            })
            .await?;
        Ok(lockers.iter().any(|l| {
            self.holder.same_host(&l.token.lock_id)
                && vol.lock.as_ref().is_none_or(|recorded| recorded == &l.token)
        }))
    }

    /// The lock this host holds on `vol`'s image, if any, regardless of what
    /// the record says.
    pub async fn held(&self, vol: &Volume) -> Result<Option<LockToken>, VolumeError> {
        let lockers = self
            .cluster
            .call(Step::Inspect, &vol.name, |s| async move {
                let pool = s.open_pool(&vol.pool).await?;
                s.lockers(&pool, &vol.image).await
            })
            .await?;
        Ok(lockers
            .into_iter()
            .map(|l| l.token)
            .find(|t| self.holder.same_host(&t.lock_id)))
    }
}

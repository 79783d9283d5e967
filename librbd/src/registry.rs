//! Persisted volume registry.
//!
//! One JSON record per volume lives under the registry directory:
//!
//! ```text
//! <root>/volumes/
//!   volume_<name>.json
//! ```
//!
//! The in-memory map is guarded by a single structural mutex that is never
//! held across an `await`. Long-running operations instead mark the entry
//! busy through a [`Lease`] (or a [`Reservation`] while the record does not
//! exist yet); any other operation on a busy volume fails fast with
//! [`VolumeError::Busy`]. Record changes are written to disk before the map is
//! updated, so the map never claims a state the disk does not hold.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::VolumeError;
use crate::types::{Volume, VolumeState};

const RECORD_PREFIX: &str = "volume_";
const RECORD_SUFFIX: &str = ".json";

#[derive(Debug, Default)]
struct Entry {
    /// `None` while a create is in flight.
    record: Option<Volume>,
    /// Operation currently holding the volume.
    busy: Option<&'static str>,
    /// `record` is ahead of the file on disk.
    dirty: bool,
}

/// Name → record map plus its on-disk mirror.
#[derive(Debug)]
pub struct Registry {
    dir: PathBuf,
    entries: Mutex<HashMap<String, Entry>>,
}

/// Result of [`Registry::reserve`].
pub enum Reserve<'a> {
    /// A record with this name already exists.
    Existing(Volume),
    /// The name is now reserved for a create.
    New(Reservation<'a>),
}

impl Registry {
    /// Open the registry in `dir`, loading every record found there.
    ///
    /// Unreadable or malformed records are skipped with a warning.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, VolumeError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| VolumeError::Storage(format!("create {}: {e}", dir.display())))?;

        let mut entries = HashMap::new();
        let mut listing = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| VolumeError::Storage(format!("read_dir {}: {e}", dir.display())))?;

        while let Some(entry) = listing.next_entry().await.map_err(VolumeError::storage)? {
            let path = entry.path();
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(RECORD_PREFIX))
                .and_then(|n| n.strip_suffix(RECORD_SUFFIX))
                .map(str::to_owned)
            else {
                continue;
            };

            let json = match tokio::fs::read_to_string(&path).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read volume record, skipping");
                    continue;
                }
            };
            let volume: Volume = match serde_json::from_str(&json) {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse volume record, skipping");
                    continue;
                }
            };
            if volume.name != name {
                warn!(path = %path.display(), name = %volume.name, "record name does not match file name, skipping");
                continue;
            }
            entries.insert(
                name,
                Entry {
                    record: Some(volume),
                    busy: None,
                    dirty: false,
                },
            );
        }

        info!(dir = %dir.display(), count = entries.len(), "volume registry loaded");
        Ok(Self {
            dir,
            entries: Mutex::new(entries),
        })
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{RECORD_PREFIX}{name}{RECORD_SUFFIX}"))
    }

    pub fn get(&self, name: &str) -> Option<Volume> {
        self.entries.lock().get(name).and_then(|e| e.record.clone())
    }

    /// Snapshot of every record, ordered by name.
    pub fn list(&self) -> Vec<Volume> {
        let mut out: Vec<Volume> = self
            .entries
            .lock()
            .values()
            .filter_map(|e| e.record.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Mark `name` busy with `op` for the lifetime of the returned lease.
    pub fn claim(&self, name: &str, op: &'static str) -> Result<Lease<'_>, VolumeError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_owned()))?;
        if let Some(current) = entry.busy {
            return Err(VolumeError::busy(name, format!("{current} in progress")));
        }
        let volume = entry
            .record
            .clone()
            .ok_or_else(|| VolumeError::busy(name, "create in progress"))?;
        entry.busy = Some(op);
        debug!(volume = name, op, "claimed");
        Ok(Lease {
            registry: self,
            volume,
            removed: false,
        })
    }

    /// Reserve `name` for a create, or return the existing record.
    pub fn reserve(&self, name: &str) -> Result<Reserve<'_>, VolumeError> {
        let mut entries = self.entries.lock();
        match entries.get(name) {
            Some(Entry { busy: Some(op), .. }) => {
                Err(VolumeError::busy(name, format!("{op} in progress")))
            }
            Some(Entry {
                record: Some(v), ..
            }) => Ok(Reserve::Existing(v.clone())),
            _ => {
                entries.insert(
                    name.to_owned(),
                    Entry {
                        record: None,
                        busy: Some("create"),
                        dirty: false,
                    },
                );
                Ok(Reserve::New(Reservation {
                    registry: self,
                    name: name.to_owned(),
                    committed: false,
                }))
            }
        }
    }

    /// Write `volume` to disk atomically: temp file, fsync, rename.
    async fn persist(&self, volume: &Volume) -> Result<(), VolumeError> {
        let path = self.record_path(&volume.name);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(volume).map_err(VolumeError::storage)?;

        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &json).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &path).await
        };
        if let Err(e) = write.await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(VolumeError::Storage(format!("write {}: {e}", path.display())));
        }
        debug!(volume = %volume.name, state = %volume.state, "record persisted");
        Ok(())
    }

    async fn erase(&self, name: &str) -> Result<(), VolumeError> {
        let path = self.record_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VolumeError::Storage(format!("remove {}: {e}", path.display()))),
        }
    }

    /// Replace the record of an idle volume.
    pub async fn put(&self, volume: Volume) -> Result<(), VolumeError> {
        let mut lease = self.claim(&volume.name, "reconcile")?;
        lease.commit(volume).await
    }

    /// Drop the record of an idle, `Registered` volume.
    pub async fn delete(&self, name: &str) -> Result<(), VolumeError> {
        let lease = self.claim(name, "delete")?;
        if lease.volume().state != VolumeState::Registered {
            return Err(VolumeError::busy(
                name,
                format!("volume is {}", lease.volume().state),
            ));
        }
        lease.remove().await
    }

    #[cfg(test)]
    pub(crate) fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

/// Exclusive right to operate on one volume.
///
/// Dropping the lease clears the busy marker. The record itself only changes
/// through [`Lease::commit`], [`Lease::publish`] and [`Lease::remove`].
#[derive(Debug)]
pub struct Lease<'a> {
    registry: &'a Registry,
    volume: Volume,
    removed: bool,
}

impl Lease<'_> {
    /// The record as last committed.
    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Persist `next` and publish it.
    pub async fn commit(&mut self, next: Volume) -> Result<(), VolumeError> {
        self.registry.persist(&next).await?;
        if let Some(entry) = self.registry.entries.lock().get_mut(&next.name) {
            entry.record = Some(next.clone());
            entry.dirty = false;
        }
        self.volume = next;
        Ok(())
    }

    /// Publish `next` without writing it. The entry is marked dirty and the
    /// next [`Lease::flush`] or commit writes it out.
    ///
    /// For steps that already happened on the host: the map must not keep
    /// claiming a mount, device or lock that is gone.
    pub fn publish(&mut self, next: Volume) {
        if let Some(entry) = self.registry.entries.lock().get_mut(&next.name) {
            entry.record = Some(next.clone());
            entry.dirty = true;
        }
        self.volume = next;
    }

    /// Write the record out if an earlier [`Lease::publish`] left it dirty.
    pub async fn flush(&mut self) -> Result<(), VolumeError> {
        let dirty = self
            .registry
            .entries
            .lock()
            .get(&self.volume.name)
            .is_some_and(|e| e.dirty);
        if dirty {
            self.commit(self.volume.clone()).await?;
            debug!(volume = %self.volume.name, "dirty record flushed");
        }
        Ok(())
    }

    /// Delete the record from disk and from the map.
    pub async fn remove(mut self) -> Result<(), VolumeError> {
        self.registry.erase(&self.volume.name).await?;
        self.registry.entries.lock().remove(&self.volume.name);
        self.removed = true;
        debug!(volume = %self.volume.name, "record removed");
        Ok(())
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        // After `remove` the name may already belong to a new reservation.
        if self.removed {
            return;
        }
        if let Some(entry) = self.registry.entries.lock().get_mut(&self.volume.name) {
            entry.busy = None;
        }
    }
}

/// A name reserved for an in-flight create.
///
/// Dropped without [`Reservation::commit`], the reservation disappears and
/// leaves no record behind.
#[derive(Debug)]
pub struct Reservation<'a> {
    registry: &'a Registry,
    name: String,
    committed: bool,
}

impl Reservation<'_> {
    /// Persist the new record and publish it.
    pub async fn commit(mut self, volume: Volume) -> Result<Volume, VolumeError> {
        self.registry.persist(&volume).await?;
        self.registry.entries.lock().insert(
            self.name.clone(),
            Entry {
                record: Some(volume.clone()),
                busy: None,
                dirty: false,
            },
        );
        self.committed = true;
        Ok(volume)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.entries.lock().remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VolumeSpec;

    fn volume(name: &str) -> Volume {
        Volume::new(
            name,
            &VolumeSpec {
                pool: "rancher".into(),
                size_bytes: 1 << 30,
                fs_type: "ext4".into(),
            },
            true,
        )
    }

    async fn create(reg: &Registry, name: &str) -> Volume {
        match reg.reserve(name).unwrap() {
            Reserve::New(r) => r.commit(volume(name)).await.unwrap(),
            Reserve::Existing(_) => panic!("{name} already registered"),
        }
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let reg = Registry::open(tmp.path()).await.unwrap();
            create(&reg, "data1").await;
            let mut lease = reg.claim("data1", "mount").unwrap();
            let mut next = lease.volume().clone();
            next.state = VolumeState::Mapped;
            next.device = Some("/dev/rbd0".into());
            lease.commit(next).await.unwrap();
        }

        let reg = Registry::open(tmp.path()).await.unwrap();
        let vol = reg.get("data1").unwrap();
        assert_eq!(vol.state, VolumeState::Mapped);
        assert_eq!(vol.device, Some(PathBuf::from("/dev/rbd0")));
        assert!(tmp.path().join("volume_data1.json").exists());
    }

    #[tokio::test]
    async fn malformed_records_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("volume_bad.json"), "{not json").unwrap();
        let mut other = volume("other");
        other.name = "renamed".into();
        std::fs::write(
            tmp.path().join("volume_other.json"),
            serde_json::to_string(&other).unwrap(),
        )
        .unwrap();
        std::fs::write(tmp.path().join("unrelated.txt"), "x").unwrap();

        let reg = Registry::open(tmp.path()).await.unwrap();
        assert!(reg.list().is_empty());
    }

    #[tokio::test]
    async fn busy_volume_rejects_second_claim() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::open(tmp.path()).await.unwrap();
        create(&reg, "data1").await;

        let lease = reg.claim("data1", "mount").unwrap();
        let err = reg.claim("data1", "unmount").unwrap_err();
        assert!(matches!(err, VolumeError::Busy { ref reason, .. } if reason == "mount in progress"));
        assert!(matches!(reg.reserve("data1"), Err(VolumeError::Busy { .. })));
        drop(lease);
        assert!(reg.claim("data1", "unmount").is_ok());
    }

    #[tokio::test]
    async fn unknown_volume_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::open(tmp.path()).await.unwrap();
        assert!(matches!(reg.claim("ghost", "mount"), Err(VolumeError::NotFound(_))));
        assert!(matches!(reg.delete("ghost").await, Err(VolumeError::NotFound(_))));
    }

    #[tokio::test]
    async fn dropped_reservation_leaves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::open(tmp.path()).await.unwrap();
        let Reserve::New(reservation) = reg.reserve("data1").unwrap() else {
            panic!("expected a new reservation");
        };
        assert!(matches!(reg.claim("data1", "mount"), Err(VolumeError::Busy { .. })));
        assert!(reg.get("data1").is_none());
        drop(reservation);
        assert!(matches!(reg.claim("data1", "mount"), Err(VolumeError::NotFound(_))));
        assert!(matches!(reg.reserve("data1"), Ok(Reserve::New(_))));
    }

    #[tokio::test]
    async fn delete_requires_registered() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::open(tmp.path()).await.unwrap();
        let mut vol = create(&reg, "data1").await;
        vol.state = VolumeState::Locked;
        reg.put(vol).await.unwrap();
        assert!(matches!(reg.delete("data1").await, Err(VolumeError::Busy { .. })));

        let mut vol = reg.get("data1").unwrap();
        vol.reset();
        reg.put(vol).await.unwrap();
        reg.delete("data1").await.unwrap();
        assert!(reg.get("data1").is_none());
        assert!(!reg.dir().join("volume_data1.json").exists());
    }

    #[tokio::test]
    async fn published_record_is_flushed_later() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("volumes");
        let reg = Registry::open(&dir).await.unwrap();
        create(&reg, "data1").await;

        // The registry directory turns into a file: every write fails.
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, "").unwrap();

        let mut lease = reg.claim("data1", "unmount").unwrap();
        let mut next = lease.volume().clone();
        next.state = VolumeState::Locked;
        assert!(matches!(lease.commit(next.clone()).await, Err(VolumeError::Storage(_))));
        assert_eq!(reg.get("data1").unwrap().state, VolumeState::Registered);

        lease.publish(next);
        assert_eq!(reg.get("data1").unwrap().state, VolumeState::Locked);
        assert!(lease.flush().await.is_err());
        drop(lease);

        std::fs::remove_file(&dir).unwrap();
        std::fs::create_dir(&dir).unwrap();
        reg.claim("data1", "mount").unwrap().flush().await.unwrap();

        let reopened = Registry::open(&dir).await.unwrap();
        assert_eq!(reopened.get("data1").unwrap().state, VolumeState::Locked);
    }

    #[tokio::test]
    async fn removed_lease_leaves_new_reservation_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::open(tmp.path()).await.unwrap();
        create(&reg, "data1").await;

        // What `Lease::remove` does before the lease is dropped.
        let mut lease = reg.claim("data1", "remove").unwrap();
        reg.erase("data1").await.unwrap();
        reg.entries.lock().remove("data1");
        lease.removed = true;

        let Reserve::New(reservation) = reg.reserve("data1").unwrap() else {
            panic!("expected a new reservation");
        };
        drop(lease);
        assert!(matches!(reg.reserve("data1"), Err(VolumeError::Busy { .. })));
        reservation.commit(volume("data1")).await.unwrap();
        assert!(reg.claim("data1", "mount").is_ok());
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Registry::open(tmp.path()).await.unwrap();
        for name in ["c", "a", "b"] {
            create(&reg, name).await;
        }
        let names: Vec<String> = reg.list().into_iter().map(|v| v.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}

//! In-process simulated cluster.
//!
//! A [`MemoryCluster`] holds pools, images and their locks. Each call to
//! [`MemoryCluster::host`] yields a [`MemoryBackend`] standing for one host,
//! with its own table of mapped kernel devices named after
//! [`ClusterSpec::device_prefix`]. Cloning a `MemoryBackend`
//! shares that table, which lets a test drop a driver and open a new one on
//! the "same host" to simulate a process restart.
//!
//! Failure injection covers an unreachable cluster, a failing `map` and a
//! slow `map`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Backend, ClusterSpec, PoolContext, Session};
use crate::error::VolumeError;
use crate::types::{HolderId, LockToken, Locker, MappedDevice};

#[derive(Debug)]
struct ClusterState {
    reachable: bool,
    next_client: u64,
    pools: BTreeMap<String, BTreeMap<String, MemoryImage>>,
    lock_calls: usize,
}

#[derive(Debug, Clone)]
struct MemoryImage {
    size_bytes: u64,
    lockers: Vec<Locker>,
}

#[derive(Debug, Default)]
struct HostState {
    devices: BTreeMap<u32, MappedDevice>,
    fail_map: Option<String>,
    map_delay: Option<Duration>,
    lock_delay: Option<Duration>,
}

/// Shared simulated cluster.
#[derive(Debug, Clone)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                reachable: true,
                next_client: 4100,
                pools: BTreeMap::new(),
                lock_calls: 0,
            })),
        }
    }

    /// A cluster with the given (empty) pools.
    pub fn with_pools(pools: &[&str]) -> Self {
        let cluster = Self::new();
        for pool in pools {
            cluster.add_pool(pool);
        }
        cluster
    }

    pub fn add_pool(&self, pool: &str) {
        self.state.lock().pools.entry(pool.to_owned()).or_default();
    }

    /// A new host attached to this cluster.
    pub fn host(&self) -> MemoryBackend {
        MemoryBackend {
            cluster: self.clone(),
            host: Arc::new(Mutex::new(HostState::default())),
        }
    }

    /// Simulate a network partition between every host and the cluster.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().reachable = reachable;
    }

    /// Number of `lock_image` calls served so far.
    pub fn lock_calls(&self) -> usize {
        self.state.lock().lock_calls
    }

    pub fn image_size(&self, pool: &str, image: &str) -> Option<u64> {
        self.state
            .lock()
            .pools
            .get(pool)
            .and_then(|images| images.get(image))
            .map(|img| img.size_bytes)
    }

    pub fn lockers(&self, pool: &str, image: &str) -> Vec<Locker> {
        self.state
            .lock()
            .pools
            .get(pool)
            .and_then(|images| images.get(image))
            .map(|img| img.lockers.clone())
            .unwrap_or_default()
    }

    /// Drop every lock on `image`, as an operator running `rbd lock rm` would.
    pub fn break_locks(&self, pool: &str, image: &str) {
        if let Some(img) = self
            .state
            .lock()
            .pools
            .get_mut(pool)
            .and_then(|images| images.get_mut(image))
        {
            img.lockers.clear();
        }
    }
}

/// One simulated host.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    cluster: MemoryCluster,
    host: Arc<Mutex<HostState>>,
}

impl MemoryBackend {
    /// Make the next `map_image` fail with `reason`.
    pub fn fail_next_map(&self, reason: &str) {
        self.host.lock().fail_map = Some(reason.to_owned());
    }

    /// Delay every `map_image` by `delay`.
    pub fn set_map_delay(&self, delay: Option<Duration>) {
        self.host.lock().map_delay = delay;
    }

    /// Delay every `lock_image` by `delay`, after the lock has been taken.
    pub fn set_lock_delay(&self, delay: Option<Duration>) {
        self.host.lock().lock_delay = delay;
    }

    pub fn mapped(&self) -> Vec<MappedDevice> {
        self.host.lock().devices.values().cloned().collect()
    }

    /// Forget every mapping, as a host reboot would.
    pub fn reboot(&self) {
        self.host.lock().devices.clear();
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn connect(&self, spec: &ClusterSpec) -> Result<Arc<dyn Session>, VolumeError> {
        let client = {
            let mut state = self.cluster.state.lock();
            if !state.reachable {
                return Err(VolumeError::Backend("cluster unreachable".into()));
            }
            state.next_client += 1;
            format!("client.{}", state.next_client)
        };
        Ok(Arc::new(MemorySession {
            cluster: self.cluster.clone(),
            host: Arc::clone(&self.host),
            device_prefix: spec.device_prefix.clone(),
            client,
        }))
    }
}

struct MemorySession {
    cluster: MemoryCluster,
    host: Arc<Mutex<HostState>>,
    device_prefix: String,
    client: String,
}

impl MemorySession {
    /// Run `f` against the cluster state, failing if the cluster is
    /// unreachable.
    fn with_cluster<T>(
        &self,
        f: impl FnOnce(&mut ClusterState) -> Result<T, VolumeError>,
    ) -> Result<T, VolumeError> {
        let mut state = self.cluster.state.lock();
        if !state.reachable {
            return Err(VolumeError::Backend("cluster unreachable".into()));
        }
        f(&mut state)
    }
}

fn image_mut<'a>(
    state: &'a mut ClusterState,
    pool: &str,
    image: &str,
) -> Result<&'a mut MemoryImage, VolumeError> {
    state
        .pools
        .get_mut(pool)
        .and_then(|images| images.get_mut(image))
        .ok_or_else(|| VolumeError::Backend(format!("image {pool}/{image} does not exist")))
}

#[async_trait]
impl Session for MemorySession {
    async fn open_pool(&self, pool: &str) -> Result<PoolContext, VolumeError> {
        self.with_cluster(|state| {
            if state.pools.contains_key(pool) {
                Ok(PoolContext {
                    pool: pool.to_owned(),
                })
            } else {
                Err(VolumeError::Config(format!("pool {pool} does not exist")))
            }
        })
    }

    async fn image_exists(&self, pool: &PoolContext, image: &str) -> Result<bool, VolumeError> {
        self.with_cluster(|state| {
            Ok(state
                .pools
                .get(&pool.pool)
                .is_some_and(|images| images.contains_key(image)))
        })
    }

    async fn create_image(
        &self,
        pool: &PoolContext,
        image: &str,
        size_bytes: u64,
    ) -> Result<(), VolumeError> {
        self.with_cluster(|state| {
            let images = state.pools.entry(pool.pool.clone()).or_default();
            if images.contains_key(image) {
                return Err(VolumeError::Backend(format!(
                    "image {}/{image} already exists",
                    pool.pool
                )));
            }
            images.insert(
                image.to_owned(),
                MemoryImage {
                    size_bytes,
                    lockers: Vec::new(),
                },
            );
            Ok(())
        })
    }

    async fn lockers(&self, pool: &PoolContext, image: &str) -> Result<Vec<Locker>, VolumeError> {
        self.with_cluster(|state| Ok(image_mut(state, &pool.pool, image)?.lockers.clone()))
    }

    async fn lock_image(
        &self,
        pool: &PoolContext,
        image: &str,
        holder: &HolderId,
    ) -> Result<LockToken, VolumeError> {
        let lock_id = holder.lock_id();
        let taken = self.with_cluster(|state| {
            state.lock_calls += 1;
            let img = image_mut(state, &pool.pool, image)?;
            if let Some(existing) = img.lockers.first() {
                if existing.token.lock_id == lock_id {
                    return Ok(existing.token.clone());
                }
                return Err(VolumeError::LockConflict {
                    name: image.to_owned(),
                    holder: existing.token.lock_id.clone(),
                });
            }
            let token = LockToken {
                lock_id,
                locker: self.client.clone(),
            };
            img.lockers.push(Locker {
                token: token.clone(),
                address: None,
            });
            Ok(token)
        });
        let delay = self.host.lock().lock_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        taken
    }

    async fn unlock_image(
        &self,
        pool: &PoolContext,
        image: &str,
        token: &LockToken,
    ) -> Result<(), VolumeError> {
        self.with_cluster(|state| {
            image_mut(state, &pool.pool, image)?
                .lockers
                .retain(|l| &l.token != token);
            Ok(())
        })
    }

    async fn map_image(&self, pool: &PoolContext, image: &str) -> Result<PathBuf, VolumeError> {
        self.with_cluster(|state| image_mut(state, &pool.pool, image).map(|_| ()))?;

        let delay = self.host.lock().map_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut host = self.host.lock();
        if let Some(reason) = host.fail_map.take() {
            return Err(VolumeError::device(image, reason));
        }
        let id = (0..)
            .find(|n| !host.devices.contains_key(n))
            .unwrap_or_default();
        let device = PathBuf::from(format!("{}{id}", self.device_prefix));
        host.devices.insert(
            id,
            MappedDevice {
                pool: pool.pool.clone(),
                image: image.to_owned(),
                device: device.clone(),
            },
        );
        Ok(device)
    }

    async fn unmap_image(&self, device: &Path) -> Result<(), VolumeError> {
        let mut host = self.host.lock();
        let id = host
            .devices
            .iter()
            .find(|(_, d)| d.device == device)
            .map(|(id, _)| *id)
            .ok_or_else(|| {
                VolumeError::device(&device.display().to_string(), "device is not mapped")
            })?;
        host.devices.remove(&id);
        Ok(())
    }

    async fn mapped_devices(&self) -> Result<Vec<MappedDevice>, VolumeError> {
        Ok(self.host.lock().devices.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ClusterSpec {
        ClusterSpec {
            cluster: "ceph".into(),
            servers: vec![],
            user: "admin".into(),
            secret: None,
            conf: PathBuf::from("/etc/ceph/ceph.conf"),
            device_prefix: "/dev/rbd".into(),
        }
    }

    async fn session(backend: &MemoryBackend) -> Arc<dyn Session> {
        backend.connect(&spec()).await.unwrap()
    }

    #[tokio::test]
    async fn lock_is_exclusive_across_hosts() {
        let cluster = MemoryCluster::with_pools(&["rancher"]);
        let a = session(&cluster.host()).await;
        let b = session(&cluster.host()).await;
        let pool = a.open_pool("rancher").await.unwrap();
        a.create_image(&pool, "data1", 1 << 30).await.unwrap();

        let holder_a = HolderId::new("node-a", 1);
        let token = a.lock_image(&pool, "data1", &holder_a).await.unwrap();
        assert_eq!(token.lock_id, "node-a:1");

        // Re-locking under the same identity returns the same token.
        assert_eq!(a.lock_image(&pool, "data1", &holder_a).await.unwrap(), token);

        let err = b
            .lock_image(&pool, "data1", &HolderId::new("node-b", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::LockConflict { ref holder, .. } if holder == "node-a:1"));

        a.unlock_image(&pool, "data1", &token).await.unwrap();
        assert!(cluster.lockers("rancher", "data1").is_empty());
        assert_eq!(cluster.lock_calls(), 3);
    }

    #[tokio::test]
    async fn devices_are_per_host() {
        let cluster = MemoryCluster::with_pools(&["rancher"]);
        let host_a = cluster.host();
        let a = session(&host_a).await;
        let pool = a.open_pool("rancher").await.unwrap();
        a.create_image(&pool, "one", 1).await.unwrap();
        a.create_image(&pool, "two", 1).await.unwrap();

        assert_eq!(a.map_image(&pool, "one").await.unwrap(), PathBuf::from("/dev/rbd0"));
        assert_eq!(a.map_image(&pool, "two").await.unwrap(), PathBuf::from("/dev/rbd1"));
        a.unmap_image(Path::new("/dev/rbd0")).await.unwrap();
        assert_eq!(a.map_image(&pool, "one").await.unwrap(), PathBuf::from("/dev/rbd0"));

        let b = session(&cluster.host()).await;
        assert!(b.mapped_devices().await.unwrap().is_empty());
        assert_eq!(host_a.mapped().len(), 2);
    }

    #[tokio::test]
    async fn devices_follow_configured_prefix() {
        let cluster = MemoryCluster::with_pools(&["rancher"]);
        let mut nbd = spec();
        nbd.device_prefix = "/dev/nbd".into();
        let s = cluster.host().connect(&nbd).await.unwrap();
        let pool = s.open_pool("rancher").await.unwrap();
        s.create_image(&pool, "one", 1).await.unwrap();
        assert_eq!(s.map_image(&pool, "one").await.unwrap(), PathBuf::from("/dev/nbd0"));
    }

    #[tokio::test]
    async fn unreachable_cluster() {
        let cluster = MemoryCluster::with_pools(&["rancher"]);
        let backend = cluster.host();
        let s = session(&backend).await;
        cluster.set_reachable(false);
        assert!(matches!(s.open_pool("rancher").await, Err(VolumeError::Backend(_))));
        assert!(matches!(backend.connect(&spec()).await, Err(VolumeError::Backend(_))));
        // Kernel-side inspection still works.
        assert!(s.mapped_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_map_failure() {
        let cluster = MemoryCluster::with_pools(&["rancher"]);
        let backend = cluster.host();
        let s = session(&backend).await;
        let pool = s.open_pool("rancher").await.unwrap();
        s.create_image(&pool, "v", 1).await.unwrap();
        backend.fail_next_map("rbd: sysfs write failed");
        assert!(matches!(s.map_image(&pool, "v").await, Err(VolumeError::Device { .. })));
        assert!(s.map_image(&pool, "v").await.is_ok());
    }

    #[tokio::test]
    async fn missing_pool_is_config_error() {
        let cluster = MemoryCluster::new();
        let s = session(&cluster.host()).await;
        assert!(matches!(s.open_pool("nope").await, Err(VolumeError::Config(_))));
    }
}

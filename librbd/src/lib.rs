//! # librbd: exclusive-attach Ceph RBD volumes for container hosts
//!
//! `librbd` attaches network block volumes backed by Ceph RBD images to the
//! local host. A volume is attached by taking the image's exclusive lock,
//! mapping it to a kernel block device and mounting its filesystem under the
//! driver root; at most one host holds a volume at a time. State is persisted
//! per volume and reconciled against the kernel and the cluster at startup.
//! It follows the RK8s conventions (Tokio async runtime, `tracing` for
//! observability, `thiserror` for structured errors).
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeState`, lock identity, requests. |
//! | [`error`] | [`VolumeError`] enum covering all failure modes. |
//! | [`config`] | [`DriverConfig`]: defaults, option map and YAML loading. |
//! | [`registry`] | Persisted name → record map with per-volume busy leases. |
//! | [`cluster`] | Shared, reconnecting cluster session. |
//! | [`lock`] | [`LockManager`]: exclusive image locks. |
//! | [`device`] | [`DeviceMapper`]: kernel map / unmap. |
//! | [`mount`] | [`MountManager`]: probe, format, mount, unmount. |
//! | [`driver`] | [`VolumeDriver`] façade, rollback and reconciliation. |
//! | [`backend`] | Cluster backends: `rbd` CLI and in-memory simulation. |
//! | [`exec`] | [`CommandRunner`] process execution seam. |
//! | [`step`] | Per-step timeouts. |

pub mod backend;
pub mod cluster;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod exec;
pub mod lock;
pub mod mount;
pub mod registry;
pub mod step;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::{Backend, MemoryBackend, MemoryCluster, RbdBackend, Session};
pub use config::DriverConfig;
pub use device::DeviceMapper;
pub use driver::VolumeDriver;
pub use error::VolumeError;
pub use exec::{CommandRunner, HostRunner};
pub use lock::LockManager;
pub use mount::MountManager;
pub use types::*;

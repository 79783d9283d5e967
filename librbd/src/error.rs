//! Driver error types.
//!
//! Every failure surfaced by `librbd` is a [`VolumeError`]. Each component
//! reports the most specific kind it can determine, and the driver façade
//! passes that kind through unchanged. The enum is [`Serialize`] so the CLI
//! can print errors in the same JSON shape as its results.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for volume operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum VolumeError {
    /// Malformed configuration or request options.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A volume with this name exists with different options.
    #[error("volume {0} already exists with different options")]
    AlreadyExists(String),

    /// The volume is not known to this host.
    #[error("volume {0} not found")]
    NotFound(String),

    /// The backing image is locked by another host or process.
    #[error("volume {name} is locked by {holder}")]
    LockConflict {
        /// Volume name.
        name: String,
        /// Lock id of the current holder as reported by the backend.
        holder: String,
    },

    /// An operation is already in flight on this volume, or a teardown
    /// precondition is not met.
    #[error("volume {name} is busy: {reason}")]
    Busy {
        /// Volume name.
        name: String,
        /// What the volume is busy with.
        reason: String,
    },

    /// Kernel map or unmap failure.
    #[error("device error for volume {name}: {reason}")]
    Device {
        /// Volume name.
        name: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Filesystem format, mount or unmount failure.
    #[error("mount failed at {path}: {reason}")]
    Mount {
        /// Mount point involved in the failure.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Reconciliation could not verify the recorded lock or device.
    #[error("volume {0} is inconsistent and must be cleared before use")]
    Inconsistent(String),

    /// The storage cluster could not be reached or rejected a request.
    #[error("backend error: {0}")]
    Backend(String),

    /// The on-disk registry could not be read or written.
    #[error("registry storage error: {0}")]
    Storage(String),
}

impl VolumeError {
    /// Create a [`VolumeError::Backend`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::Backend(e.to_string())
    }

    /// Create a [`VolumeError::Storage`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn storage<E: std::fmt::Display>(e: E) -> Self {
        Self::Storage(e.to_string())
    }

    /// Create a [`VolumeError::Device`] for `name`.
    pub fn device<E: std::fmt::Display>(name: &str, e: E) -> Self {
        Self::Device {
            name: name.to_owned(),
            reason: e.to_string(),
        }
    }

    /// Create a [`VolumeError::Mount`] for a mount point.
    pub fn mount<E: std::fmt::Display>(path: impl AsRef<std::path::Path>, e: E) -> Self {
        Self::Mount {
            path: path.as_ref().display().to_string(),
            reason: e.to_string(),
        }
    }

    /// Create a [`VolumeError::Busy`] for `name`.
    pub fn busy(name: &str, reason: impl Into<String>) -> Self {
        Self::Busy {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may simply retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockConflict { .. } | Self::Busy { .. })
    }
}

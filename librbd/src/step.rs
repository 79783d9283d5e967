//! Timeouts for individual lifecycle steps.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::VolumeError;

/// One backend or kernel step of the volume lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Connect,
    Inspect,
    CreateImage,
    Lock,
    Unlock,
    Map,
    Unmap,
    Format,
    Mount,
    Unmount,
}

impl Step {
    /// The error a timed-out step is reported as. A timeout is a failure of
    /// the step itself, so it carries that step's error kind.
    pub fn timeout_error(self, subject: &str, after: Duration) -> VolumeError {
        let reason = format!("{self} timed out after {}s", after.as_secs());
        match self {
            Self::Connect | Self::Inspect | Self::CreateImage | Self::Lock | Self::Unlock => {
                VolumeError::Backend(format!("{subject}: {reason}"))
            }
            Self::Map | Self::Unmap => VolumeError::device(subject, reason),
            Self::Format | Self::Mount | Self::Unmount => VolumeError::mount(subject, reason),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Inspect => "inspect",
            Self::CreateImage => "create image",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::Map => "map",
            Self::Unmap => "unmap",
            Self::Format => "format",
            Self::Mount => "mount",
            Self::Unmount => "unmount",
        };
        f.write_str(s)
    }
}

/// Run `fut` for at most `limit`. `subject` names the volume (or mount point
/// for filesystem steps) in the timeout error.
pub async fn bounded<T, F>(step: Step, subject: &str, limit: Duration, fut: F) -> Result<T, VolumeError>
where
    F: Future<Output = Result<T, VolumeError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(%step, subject, timeout = ?limit, "step timed out");
            Err(step.timeout_error(subject, limit))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_step_kind() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, VolumeError>(())
        };
        let err = bounded(Step::Map, "data1", Duration::from_secs(1), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::Device { ref name, .. } if name == "data1"));

        let err = Step::Lock.timeout_error("data1", Duration::from_secs(5));
        assert!(matches!(err, VolumeError::Backend(_)));
        let err = Step::Format.timeout_error("/mnt/data1", Duration::from_secs(5));
        assert!(matches!(err, VolumeError::Mount { .. }));
    }

    #[tokio::test]
    async fn fast_step_passes_through() {
        let out = bounded(Step::Inspect, "v", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
    }
}

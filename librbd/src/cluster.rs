//! Shared, lazily (re)connected cluster session.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::backend::{Backend, ClusterSpec, Session};
use crate::error::VolumeError;
use crate::step::{Step, bounded};

/// Owns the connection to the storage cluster.
///
/// The session is opened on first use and shared by every operation. When a
/// call fails with [`VolumeError::Backend`] the session is dropped and the call
/// is retried once on a fresh connection.
pub struct Cluster {
    backend: Arc<dyn Backend>,
    spec: ClusterSpec,
    timeout: Duration,
    session: Mutex<Option<Arc<dyn Session>>>,
}

impl Cluster {
    pub fn new(backend: Arc<dyn Backend>, spec: ClusterSpec, timeout: Duration) -> Self {
        Self {
            backend,
            spec,
            timeout,
            session: Mutex::new(None),
        }
    }

    /// The current session, connecting if needed.
    #[instrument(skip(self), fields(cluster = %self.spec.cluster))]
    pub async fn session(&self) -> Result<Arc<dyn Session>, VolumeError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }
        let session = bounded(
            Step::Connect,
            &self.spec.cluster,
            self.timeout,
            self.backend.connect(&self.spec),
        )
        .await?;
        info!("cluster session opened");
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Forget `stale` if it is still the current session.
    async fn reset(&self, stale: &Arc<dyn Session>) {
        let mut slot = self.session.lock().await;
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, stale)) {
            *slot = None;
        }
    }

    /// Run `f` against the session under the step timeout.
    ///
    /// A [`VolumeError::Backend`] failure reconnects and retries once. Other
    /// errors and timeouts are returned as they are.
    pub async fn call<T, F, Fut>(&self, step: Step, subject: &str, f: F) -> Result<T, VolumeError>
    where
        F: Fn(Arc<dyn Session>) -> Fut,
        Fut: Future<Output = Result<T, VolumeError>>,
    {
        let session = self.session().await?;
        match tokio::time::timeout(self.timeout, f(Arc::clone(&session))).await {
            Err(_) => {
                warn!(%step, subject, timeout = ?self.timeout, "step timed out");
                Err(step.timeout_error(subject, self.timeout))
            }
            Ok(Err(VolumeError::Backend(reason))) => {
                warn!(%step, subject, %reason, "backend call failed, reconnecting");
                self.reset(&session).await;
                let session = self.session().await?;
                bounded(step, subject, self.timeout, f(session)).await
            }
            Ok(other) => other,
        }
    }
}

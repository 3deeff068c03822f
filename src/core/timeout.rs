//! Hard wall-clock deadlines for blocking protocol phases.
//!
//! The guarded future runs on its own task. When the deadline passes the
//! task is aborted and the caller gets [`GatewayError::Timeout`] right away;
//! nothing waits for the underlying call to notice.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::core::error::{GatewayError, Phase, Result};

/// Deadlines for the three guarded phases of a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub metadata: Duration,
    pub discovery: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            metadata: Duration::from_secs(5),
            discovery: Duration::from_secs(30),
        }
    }
}

/// Run `fut` on a separate task and give up on it after `deadline`.
///
/// A panic inside the task is reported as `GatewayError::Internal`.
pub async fn guard<T, F>(phase: Phase, deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut task = tokio::spawn(fut);

    match tokio::time::timeout(deadline, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(GatewayError::Internal(format!(
            "{} task failed: {}",
            phase, join_err
        ))),
        Err(_) => {
            task.abort();
            warn!(%phase, ?deadline, "guarded operation abandoned");
            Err(GatewayError::Timeout {
                phase,
                after: deadline,
            })
        }
    }
}

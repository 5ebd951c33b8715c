pub mod cpu;
pub mod gpu;

pub use cpu::{CpuBackend, CpuPlatform, CpuSession, PowerLogTool, RaplDomains};
pub use gpu::{GpuQuery, GpuReading, GpuSession, NvidiaSmi};

use crate::reconcile::EnergySource;
use crate::utils::errors::MonitoringError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::Path;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Armed,
    Disarmed,
}

/// One power reading. Samples are appended in timestamp order by a single writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub power_draw_watts: f64,
}

/// A power-sampling source that runs for the span of one workload window.
///
/// `Idle -> Armed -> Disarmed`; the last transition is terminal. Arming an
/// armed session and disarming a disarmed one are no-ops.
#[async_trait]
pub trait SamplingSession: Send {
    fn source(&self) -> EnergySource;

    fn state(&self) -> SessionState;

    /// Log file owned by this session for the current run.
    fn log_path(&self) -> &Path;

    /// Start sampling without waiting for the first sample.
    async fn arm(&mut self) -> Result<(), MonitoringError>;

    /// Stop sampling. Returns only after the log has been flushed.
    async fn disarm(&mut self) -> Result<(), MonitoringError>;
}

/// A background sampling task with a cooperative stop and a flush barrier.
pub struct SamplingLoop<T> {
    token: CancellationToken,
    handle: JoinHandle<Result<T, MonitoringError>>,
}

impl<T: Send + 'static> SamplingLoop<T> {
    pub fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, MonitoringError>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(body(token.clone()));
        Self { token, handle }
    }

    /// Cancel the loop and wait until it has observed the cancellation.
    pub async fn stop(self) -> Result<T, MonitoringError> {
        self.token.cancel();
        self.handle
            .await
            .map_err(|e| MonitoringError::Other(format!("Sampling loop failed to join: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_is_a_barrier() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let sampling = SamplingLoop::spawn(move |token| async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(1)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            Ok(counter.load(Ordering::SeqCst))
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reported = sampling.stop().await.unwrap();
        let after_stop = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(reported, after_stop);
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_loop_error_surfaces_on_stop() {
        let sampling: SamplingLoop<()> = SamplingLoop::spawn(|_token| async move {
            Err(MonitoringError::Other("sensor gone".to_string()))
        });
        assert!(matches!(sampling.stop().await, Err(MonitoringError::Other(_))));
    }
}

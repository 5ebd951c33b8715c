pub mod markers;
pub mod process;

pub use markers::{Markers, MarkerWatcher};
pub use process::ProcessWatcher;

use crate::utils::errors::MonitoringError;
use crate::window::{WindowSignal, WorkloadWindow};
use async_trait::async_trait;
use std::sync::Arc;

/// A timing authority for one workload run.
///
/// `observe` fires `signal` as the workload starts and ends, and returns the
/// terminal window once the workload is gone.
#[async_trait]
pub trait Watcher: Send + 'static {
    async fn observe(self, signal: Arc<WindowSignal>) -> Result<WorkloadWindow, MonitoringError>;
}

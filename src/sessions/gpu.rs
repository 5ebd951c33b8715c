use crate::reconcile::EnergySource;
use crate::sessions::{Sample, SamplingLoop, SamplingSession, SessionState};
use crate::utils::errors::MonitoringError;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Header of the GPU log: epoch milliseconds, device index, watts.
pub const GPU_LOG_HEADER: &str = "timestamp,gpu,power_draw_w";

pub const DEFAULT_GPU_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct GpuReading {
    pub index: u32,
    pub power_draw_watts: f64,
}

/// Returns one power reading per visible GPU.
#[async_trait]
pub trait GpuQuery: Send + Sync + 'static {
    async fn query(&self) -> Result<Vec<GpuReading>, MonitoringError>;
}

/// GPU query backed by the `nvidia-smi` CLI.
#[derive(Debug, Default, Clone)]
pub struct NvidiaSmi;

impl NvidiaSmi {
    pub fn is_available() -> bool {
        // Check if nvidia-smi command exists or NVIDIA drivers are loaded
        std::process::Command::new("nvidia-smi")
            .arg("--query-gpu=count")
            .arg("--format=csv,noheader,nounits")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

/// Parse `index, power.draw` rows. Devices without a power reading are skipped.
pub fn parse_nvidia_smi(output: &str) -> Vec<GpuReading> {
    output
        .lines()
        .filter_map(|line| {
            let (index, power) = line.split_once(',')?;
            match (index.trim().parse::<u32>(), power.trim().parse::<f64>()) {
                (Ok(index), Ok(power_draw_watts)) => Some(GpuReading { index, power_draw_watts }),
                _ => {
                    debug!("Skipping nvidia-smi row: {:?}", line);
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl GpuQuery for NvidiaSmi {
    async fn query(&self) -> Result<Vec<GpuReading>, MonitoringError> {
        let output = tokio::process::Command::new("nvidia-smi")
            .arg("--query-gpu=index,power.draw")
            .arg("--format=csv,noheader,nounits")
            .output()
            .await?;
        if !output.status.success() {
            return Err(MonitoringError::Other(format!(
                "nvidia-smi exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Samples every visible GPU at a fixed interval while armed.
pub struct GpuSession<Q: GpuQuery = NvidiaSmi> {
    query: Arc<Q>,
    interval: Duration,
    log_path: PathBuf,
    state: SessionState,
    samples: Vec<Sample>,
    sampling: Option<SamplingLoop<Vec<Sample>>>,
}

impl<Q: GpuQuery> GpuSession<Q> {
    pub fn new(query: Q, log_path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            query: Arc::new(query),
            interval,
            log_path: log_path.into(),
            state: SessionState::Idle,
            samples: Vec::new(),
            sampling: None,
        }
    }

    /// Samples recorded by the last completed run.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Return a disarmed session to `Idle` for a new run.
    pub fn reset(&mut self) -> Result<(), MonitoringError> {
        if self.state == SessionState::Armed {
            return Err(MonitoringError::Other("cannot reset an armed GPU session".to_string()));
        }
        self.samples.clear();
        self.state = SessionState::Idle;
        Ok(())
    }

    async fn open_log(&self) -> Result<BufWriter<File>, MonitoringError> {
        if let Some(parent) = self.log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut writer = BufWriter::new(File::create(&self.log_path).await?);
        writer.write_all(format!("{}\n", GPU_LOG_HEADER).as_bytes()).await?;
        writer.flush().await?;
        Ok(writer)
    }
}

async fn run_sampling_loop<Q: GpuQuery>(
    query: Arc<Q>,
    interval: Duration,
    mut writer: BufWriter<File>,
    token: CancellationToken,
) -> Result<Vec<Sample>, MonitoringError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut samples = Vec::new();
    let mut iteration: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        iteration += 1;

        match query.query().await {
            Ok(readings) => {
                let timestamp = Utc::now();
                let mut rows = String::new();
                for reading in readings {
                    rows.push_str(&format!(
                        "{},{},{}\n",
                        timestamp.timestamp_millis(),
                        reading.index,
                        reading.power_draw_watts
                    ));
                    debug!("GPU {} drawing {} W", reading.index, reading.power_draw_watts);
                    samples.push(Sample {
                        timestamp,
                        source_id: reading.index.to_string(),
                        power_draw_watts: reading.power_draw_watts,
                    });
                }
                writer.write_all(rows.as_bytes()).await?;
                writer.flush().await?;
            }
            Err(err) => warn!("GPU query failed on iteration {}: {}", iteration, err),
        }
    }

    writer.flush().await?;
    info!(
        "GPU sampling stopped after {} iterations ({} samples)",
        iteration,
        samples.len()
    );
    Ok(samples)
}

#[async_trait]
impl<Q: GpuQuery> SamplingSession for GpuSession<Q> {
    fn source(&self) -> EnergySource {
        EnergySource::Gpu
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn log_path(&self) -> &Path {
        &self.log_path
    }

    async fn arm(&mut self) -> Result<(), MonitoringError> {
        match self.state {
            SessionState::Armed => return Ok(()),
            SessionState::Disarmed => {
                warn!("GPU session already finished; ignoring arm request");
                return Ok(());
            }
            SessionState::Idle => {}
        }

        let writer = self.open_log().await.map_err(|e| MonitoringError::SamplingUnavailable {
            source_name: "gpu".to_string(),
            reason: e.to_string(),
        })?;
        let query = Arc::clone(&self.query);
        let interval = self.interval;
        self.sampling = Some(SamplingLoop::spawn(move |token| {
            run_sampling_loop(query, interval, writer, token)
        }));
        self.state = SessionState::Armed;
        info!(
            "GPU power sampling started every {:?}, logging to {}",
            self.interval,
            self.log_path.display()
        );
        Ok(())
    }

    async fn disarm(&mut self) -> Result<(), MonitoringError> {
        let previous = std::mem::replace(&mut self.state, SessionState::Disarmed);
        if previous != SessionState::Armed {
            return Ok(());
        }
        if let Some(sampling) = self.sampling.take() {
            self.samples = sampling.stop().await?;
        }
        info!("Stopped GPU power sampling");
        Ok(())
    }
}

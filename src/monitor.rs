//! One monitored run of a configured project: pick the sources, watch the
//! workload, then reduce the logs into a report.

use crate::config::{MonitoringMode, ProjectConfig, WrappingMode};
use crate::coordinator::WindowCoordinator;
use crate::reconcile::{
    EmissionEstimate, EnergySource, Measurement, cpu_measurement, gpu_measurement, ram_measurement,
    rated_tdp_energy_kwh,
};
use crate::report::Report;
use crate::sessions::gpu::DEFAULT_GPU_INTERVAL;
use crate::sessions::{CpuBackend, CpuSession, GpuSession, NvidiaSmi, SamplingSession};
use crate::utils::errors::MonitoringError;
use crate::utils::psutils::total_memory_gb;
use crate::watchers::{MarkerWatcher, Markers, ProcessWatcher, markers::workload_command};
use crate::window::WorkloadWindow;
use log::{info, warn};
use std::path::{Path, PathBuf};

pub const CPU_LOG_FILE: &str = "intel_power_gadget_log.csv";
pub const GPU_LOG_FILE: &str = "gpu_power_log.csv";
pub const DEFAULT_OUTPUT_DIR: &str = "monitoring_output";

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Where the sampling logs of this run are written.
    pub log_dir: PathBuf,
    /// Where the report CSV is written.
    pub output_dir: PathBuf,
    /// Use the rated-TDP model when no CPU power logger is installed.
    pub tdp_fallback: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("."),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            tdp_fallback: false,
        }
    }
}

/// Where CPU energy comes from once the run is over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CpuSource<'a> {
    Log(&'a Path),
    RatedTdp { watts: f64 },
}

/// CPU backend for `project`, degrading to the rated-TDP model only on request.
pub fn select_cpu_backend(project: &ProjectConfig, tdp_fallback: bool) -> Result<CpuBackend, MonitoringError> {
    match CpuBackend::select(&project.cpu_info, project.cpu_tdp) {
        Err(MonitoringError::ToolUnavailable(reason)) if tdp_fallback => match project.cpu_tdp {
            Some(watts) => {
                warn!("{}; falling back to the rated TDP of {} W", reason, watts);
                Ok(CpuBackend::RatedTdp { watts })
            }
            None => Err(MonitoringError::ToolUnavailable(format!(
                "{} (no cpu_tdp configured for the fallback)",
                reason
            ))),
        },
        other => other,
    }
}

pub fn markers_for(project: &ProjectConfig) -> Markers {
    let settings = &project.model_wrapping_settings;
    match project.wrapping_mode() {
        WrappingMode::WholeProcess => Markers::WholeProcess,
        WrappingMode::KeyString => {
            Markers::from_strings(&settings.model_start_keystring, &settings.model_end_keystring)
        }
    }
}

/// Installed RAM in GB: the configured figure, else the live system total.
pub fn ram_gb(project: &ProjectConfig) -> f64 {
    project.ram_info.unwrap_or_else(total_memory_gb)
}

/// Reduce the finished run's logs into the final estimate.
///
/// Elapsed time is the CPU logger's own figure when it reported one, the
/// window duration otherwise.
pub fn reconcile_run(
    window: &WorkloadWindow,
    cpu: CpuSource<'_>,
    gpu_log: Option<&Path>,
    ram_gb: f64,
    grid_carbon_intensity: f64,
) -> EmissionEstimate {
    let window_seconds = window.elapsed_seconds().unwrap_or(0.0);
    if window.start.is_none() {
        warn!("The workload window never started; nothing was sampled");
    }

    let (cpu, elapsed_seconds) = match cpu {
        CpuSource::Log(path) => {
            let (measurement, logged) = cpu_measurement(path);
            (measurement, logged.unwrap_or(window_seconds))
        }
        CpuSource::RatedTdp { watts } => (
            Measurement::approximate(
                EnergySource::Cpu,
                rated_tdp_energy_kwh(watts, window_seconds),
                window_seconds,
            ),
            window_seconds,
        ),
    };
    let gpu = match gpu_log {
        Some(path) => gpu_measurement(path),
        None => Measurement::no_data(EnergySource::Gpu, "no GPU power provider"),
    };
    let ram = ram_measurement(ram_gb, elapsed_seconds);

    EmissionEstimate::reduce(elapsed_seconds, cpu, gpu, ram, grid_carbon_intensity)
}

fn remove_stale_log(path: &Path) -> Result<(), MonitoringError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!("Removed log from a previous run: {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Monitor one run of `project` and build its report.
pub async fn run_project(project: &ProjectConfig, options: &RunOptions) -> Result<Report, MonitoringError> {
    project.validate()?;
    let grid_carbon_intensity = project
        .grid_carbon_intensity
        .ok_or_else(|| MonitoringError::Config("grid_carbon_intensity has not been resolved".to_string()))?;

    let backend = select_cpu_backend(project, options.tdp_fallback)?;
    let rated_watts = match backend {
        CpuBackend::RatedTdp { watts } => Some(watts),
        _ => None,
    };

    let cpu_log = options.log_dir.join(CPU_LOG_FILE);
    let gpu_log = options.log_dir.join(GPU_LOG_FILE);
    remove_stale_log(&cpu_log)?;
    remove_stale_log(&gpu_log)?;

    let mut sessions: Vec<Box<dyn SamplingSession>> = vec![Box::new(CpuSession::new(backend, &cpu_log))];
    let gpu_available = tokio::task::spawn_blocking(NvidiaSmi::is_available)
        .await
        .unwrap_or(false);
    if gpu_available {
        sessions.push(Box::new(GpuSession::new(NvidiaSmi, &gpu_log, DEFAULT_GPU_INTERVAL)));
    } else {
        warn!("nvidia-smi not found; GPU energy will be reported as no data");
    }

    info!(
        "Now running energy and emission tracking for project {} ({:?})",
        project.name, project.monitoring_mode
    );
    let mut coordinator = WindowCoordinator::new(sessions);
    let settings = &project.model_wrapping_settings;
    let window = match project.monitoring_mode {
        MonitoringMode::Direct => {
            let interval = project
                .poll_interval()
                .ok_or_else(|| MonitoringError::Config("detecting_interval must be positive".to_string()))?;
            coordinator
                .run(ProcessWatcher::new(settings.process_running_name.as_str(), interval))
                .await?
        }
        MonitoringMode::Wrapped => {
            let command = workload_command(project.model_dir(), &settings.process_based_model_cmd);
            coordinator
                .run(MarkerWatcher::new(command, markers_for(project)))
                .await?
        }
    };
    info!(
        "Workload window closed ({}), reconciling logs",
        window
            .end_reason
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "no end".to_string())
    );

    let cpu = match rated_watts {
        Some(watts) => CpuSource::RatedTdp { watts },
        None => CpuSource::Log(&cpu_log),
    };
    let estimate = reconcile_run(
        &window,
        cpu,
        gpu_available.then_some(gpu_log.as_path()),
        ram_gb(project),
        grid_carbon_intensity,
    );
    Ok(Report::new(project.name.clone(), estimate, project.pue()))
}

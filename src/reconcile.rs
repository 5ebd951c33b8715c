//! Post-run reduction of sampling logs into energy and emission figures.
//!
//! Everything here reads completed logs only; it runs after every session
//! has been disarmed.

use crate::utils::errors::MonitoringError;
use log::{debug, warn};
use polars::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

pub const CPU_ENERGY_LABEL: &str = "Cumulative Processor Energy_0 (mWh)";
pub const CPU_ELAPSED_LABEL: &str = "Total Elapsed Time (sec)";

const MWH_PER_KWH: f64 = 1_000_000.0;
const SECONDS_PER_HOUR: f64 = 3_600.0;
/// Watt-seconds per kilowatt-hour.
const WS_PER_KWH: f64 = 3_600_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnergySource {
    Cpu,
    Gpu,
    Ram,
}

impl fmt::Display for EnergySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnergySource::Cpu => write!(f, "CPU"),
            EnergySource::Gpu => write!(f, "GPU"),
            EnergySource::Ram => write!(f, "RAM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateKind {
    /// Integrated from sampled power.
    Measured,
    /// Modelled from a static rating, not sampled.
    Approximate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnergyEstimate {
    pub source: EnergySource,
    pub energy_kwh: f64,
    pub elapsed_seconds: f64,
    pub kind: EstimateKind,
}

/// Outcome for one energy source. `NoData` counts as zero but is reported as such.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Estimated(EnergyEstimate),
    NoData { source: EnergySource, reason: String },
}

impl Measurement {
    pub fn measured(source: EnergySource, energy_kwh: f64, elapsed_seconds: f64) -> Self {
        Self::estimate(source, energy_kwh, elapsed_seconds, EstimateKind::Measured)
    }

    pub fn approximate(source: EnergySource, energy_kwh: f64, elapsed_seconds: f64) -> Self {
        Self::estimate(source, energy_kwh, elapsed_seconds, EstimateKind::Approximate)
    }

    pub fn no_data(source: EnergySource, reason: impl Into<String>) -> Self {
        Measurement::NoData {
            source,
            reason: reason.into(),
        }
    }

    fn estimate(source: EnergySource, energy_kwh: f64, elapsed_seconds: f64, kind: EstimateKind) -> Self {
        Measurement::Estimated(EnergyEstimate {
            source,
            energy_kwh: energy_kwh.max(0.0),
            elapsed_seconds: elapsed_seconds.max(0.0),
            kind,
        })
    }

    pub fn source(&self) -> EnergySource {
        match self {
            Measurement::Estimated(estimate) => estimate.source,
            Measurement::NoData { source, .. } => *source,
        }
    }

    pub fn energy_kwh(&self) -> f64 {
        match self {
            Measurement::Estimated(estimate) => estimate.energy_kwh,
            Measurement::NoData { .. } => 0.0,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, Measurement::NoData { .. })
    }

    pub fn is_approximate(&self) -> bool {
        matches!(
            self,
            Measurement::Estimated(EnergyEstimate {
                kind: EstimateKind::Approximate,
                ..
            })
        )
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Measurement::Estimated(estimate) if estimate.kind == EstimateKind::Approximate => {
                write!(f, "{} (approximate)", estimate.energy_kwh)
            }
            Measurement::Estimated(estimate) => write!(f, "{}", estimate.energy_kwh),
            Measurement::NoData { .. } => write!(f, "no data"),
        }
    }
}

/// Last values reported by the CPU power logger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuLogReading {
    pub energy_mwh: Option<f64>,
    pub elapsed_seconds: Option<f64>,
}

impl CpuLogReading {
    pub fn energy_kwh(&self) -> Option<f64> {
        self.energy_mwh.map(|mwh| mwh / MWH_PER_KWH)
    }
}

fn assigned_value(line: &str, label: &str) -> Option<Result<f64, std::num::ParseFloatError>> {
    if !line.contains(label) {
        return None;
    }
    let (_, value) = line.rsplit_once('=')?;
    Some(value.trim().trim_matches('"').parse::<f64>())
}

/// Scan a `<label> = <value>` log. Loggers append as they go, so the last
/// parseable assignment of each label wins.
pub fn parse_cpu_log(path: &Path) -> Result<CpuLogReading, MonitoringError> {
    let content = std::fs::read(path).map_err(|e| MonitoringError::LogParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let content = String::from_utf8_lossy(&content);

    let mut reading = CpuLogReading::default();
    for (number, line) in content.lines().enumerate() {
        for (label, slot) in [
            (CPU_ENERGY_LABEL, &mut reading.energy_mwh),
            (CPU_ELAPSED_LABEL, &mut reading.elapsed_seconds),
        ] {
            match assigned_value(line, label) {
                Some(Ok(value)) => *slot = Some(value),
                Some(Err(e)) => warn!(
                    "{}:{}: unreadable '{}' value: {}",
                    path.display(),
                    number + 1,
                    label,
                    e
                ),
                None => {}
            }
        }
    }
    debug!("Parsed CPU log {}: {:?}", path.display(), reading);
    Ok(reading)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReading {
    pub samples: usize,
    pub average_watts: f64,
    pub span_seconds: f64,
}

impl DeviceReading {
    /// Average draw over the span between the first and last sample.
    pub fn energy_kwh(&self) -> f64 {
        self.average_watts * (self.span_seconds / SECONDS_PER_HOUR) / 1000.0
    }
}

/// Per-device summary of a GPU log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GpuLogReading {
    pub samples: usize,
    /// Sum of the per-device average draws.
    pub average_watts: f64,
    pub span_seconds: f64,
    pub devices: BTreeMap<i64, DeviceReading>,
}

impl GpuLogReading {
    pub fn energy_kwh(&self) -> f64 {
        self.devices.values().map(DeviceReading::energy_kwh).sum()
    }
}

/// Reduce the tabular GPU log (`timestamp,gpu,power_draw_w`).
///
/// Rows with an unreadable timestamp or power value are dropped. A log with
/// no valid rows yields an empty reading rather than an error.
pub fn parse_gpu_log(path: &Path) -> Result<GpuLogReading, MonitoringError> {
    let parse_error = |reason: String| MonitoringError::LogParse {
        path: path.to_path_buf(),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| parse_error(e.to_string()))?;
    if content.lines().skip(1).all(|line| line.trim().is_empty()) {
        return Ok(GpuLogReading::default());
    }

    let frame = CsvReadOptions::default()
        .with_has_header(true)
        .with_ignore_errors(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .and_then(|reader| reader.finish())
        .map_err(|e| parse_error(e.to_string()))?;

    let column = |name: &str, dtype: DataType| -> Result<Column, MonitoringError> {
        frame
            .column(name)
            .and_then(|c| c.cast(&dtype))
            .map_err(|e| parse_error(e.to_string()))
    };
    let timestamps = column("timestamp", DataType::Int64)?;
    let devices = column("gpu", DataType::Int64)?;
    let power = column("power_draw_w", DataType::Float64)?;

    let mut per_device: BTreeMap<i64, (usize, f64, i64, i64)> = BTreeMap::new();
    let rows = timestamps
        .i64()?
        .into_iter()
        .zip(devices.i64()?.into_iter())
        .zip(power.f64()?.into_iter());
    for ((timestamp, device), watts) in rows {
        let (Some(timestamp), Some(device), Some(watts)) = (timestamp, device, watts) else {
            continue;
        };
        let entry = per_device.entry(device).or_insert((0, 0.0, timestamp, timestamp));
        entry.0 += 1;
        entry.1 += watts;
        entry.2 = entry.2.min(timestamp);
        entry.3 = entry.3.max(timestamp);
    }

    let devices: BTreeMap<i64, DeviceReading> = per_device
        .into_iter()
        .map(|(device, (samples, total_watts, first, last))| {
            let reading = DeviceReading {
                samples,
                average_watts: total_watts / samples as f64,
                span_seconds: (last - first) as f64 / 1000.0,
            };
            (device, reading)
        })
        .collect();

    let reading = GpuLogReading {
        samples: devices.values().map(|d| d.samples).sum(),
        average_watts: devices.values().map(|d| d.average_watts).sum(),
        span_seconds: devices.values().map(|d| d.span_seconds).fold(0.0, f64::max),
        devices,
    };
    debug!(
        "Parsed GPU log {}: {} samples over {:.1}s",
        path.display(),
        reading.samples,
        reading.span_seconds
    );
    Ok(reading)
}

/// CPU outcome from a logger file, plus the logger's own elapsed time.
pub fn cpu_measurement(path: &Path) -> (Measurement, Option<f64>) {
    match parse_cpu_log(path) {
        Ok(reading) => {
            let elapsed = reading.elapsed_seconds;
            let measurement = match reading.energy_kwh() {
                Some(kwh) => Measurement::measured(EnergySource::Cpu, kwh, elapsed.unwrap_or(0.0)),
                None => Measurement::no_data(EnergySource::Cpu, format!("no '{}' line", CPU_ENERGY_LABEL)),
            };
            (measurement, elapsed)
        }
        Err(err) => {
            warn!("CPU log unusable: {}", err);
            (Measurement::no_data(EnergySource::Cpu, err.to_string()), None)
        }
    }
}

pub fn gpu_measurement(path: &Path) -> Measurement {
    match parse_gpu_log(path) {
        Ok(reading) if reading.samples == 0 => Measurement::no_data(EnergySource::Gpu, "no GPU samples"),
        Ok(reading) => Measurement::measured(EnergySource::Gpu, reading.energy_kwh(), reading.span_seconds),
        Err(err) => {
            warn!("GPU log unusable: {}", err);
            Measurement::no_data(EnergySource::Gpu, err.to_string())
        }
    }
}

/// Rated power over the window, in kWh.
pub fn rated_tdp_energy_kwh(rated_watts: f64, elapsed_seconds: f64) -> f64 {
    rated_watts * elapsed_seconds / WS_PER_KWH
}

/// RAM draw modelled as 3 W per 8 GB, in kWh.
pub fn ram_energy_kwh(ram_gb: f64, elapsed_seconds: f64) -> f64 {
    let power_watts = 3.0 * ram_gb / 8.0;
    power_watts * (elapsed_seconds / SECONDS_PER_HOUR) / 1000.0
}

pub fn ram_measurement(ram_gb: f64, elapsed_seconds: f64) -> Measurement {
    Measurement::approximate(EnergySource::Ram, ram_energy_kwh(ram_gb, elapsed_seconds), elapsed_seconds)
}

/// Final figures for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct EmissionEstimate {
    pub elapsed_seconds: f64,
    pub cpu: Measurement,
    pub gpu: Measurement,
    pub ram: Measurement,
    pub total_energy_kwh: f64,
    pub grid_carbon_intensity: f64,
    pub total_emission_g: f64,
}

impl EmissionEstimate {
    pub fn reduce(
        elapsed_seconds: f64,
        cpu: Measurement,
        gpu: Measurement,
        ram: Measurement,
        grid_carbon_intensity: f64,
    ) -> Self {
        let total_energy_kwh = cpu.energy_kwh() + gpu.energy_kwh() + ram.energy_kwh();
        Self {
            elapsed_seconds,
            cpu,
            gpu,
            ram,
            total_energy_kwh,
            grid_carbon_intensity,
            total_emission_g: grid_carbon_intensity * total_energy_kwh,
        }
    }
}

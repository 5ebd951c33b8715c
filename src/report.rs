use crate::reconcile::{EmissionEstimate, Measurement};
use crate::utils::errors::MonitoringError;
use itertools::multiunzip;
use log::info;
use polars::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Metric/value summary of one monitored run.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub project_name: String,
    pub estimate: EmissionEstimate,
    pub pue: f64,
}

fn energy_cell(measurement: &Measurement) -> String {
    measurement.to_string()
}

impl Report {
    pub fn new(project_name: impl Into<String>, estimate: EmissionEstimate, pue: f64) -> Self {
        Self {
            project_name: project_name.into(),
            estimate,
            pue,
        }
    }

    /// Report rows in display order.
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        let estimate = &self.estimate;
        vec![
            ("Project_name", self.project_name.clone()),
            ("Elapsed Time (seconds)", estimate.elapsed_seconds.to_string()),
            ("CPU Energy (kWh)", energy_cell(&estimate.cpu)),
            ("GPU Energy (kWh)", energy_cell(&estimate.gpu)),
            ("RAM Power Usage (kWh)", energy_cell(&estimate.ram)),
            ("Total Energy Usage (kWh)", estimate.total_energy_kwh.to_string()),
            ("Grid Carbon Intensity (g/CO2 Eq)", estimate.grid_carbon_intensity.to_string()),
            ("Total Carbon Emission (g/CO2 Eq)", estimate.total_emission_g.to_string()),
            ("PUE", self.pue.to_string()),
        ]
    }

    /// DataFrame: Metric | Value
    pub fn to_frame(&self) -> Result<DataFrame, MonitoringError> {
        let (metrics, values): (Vec<String>, Vec<String>) = multiunzip(
            self.rows()
                .into_iter()
                .map(|(metric, value)| (metric.to_string(), value)),
        );
        let frame = df![
            "Metric" => metrics,
            "Value" => values,
        ]?;
        Ok(frame)
    }

    /// Write the report as `<dir>/<project>.csv` and return the path.
    pub fn write_csv(&self, dir: &Path) -> Result<PathBuf, MonitoringError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.csv", self.project_name));
        let mut frame = self.to_frame()?;
        let mut file = File::create(&path)?;
        CsvWriter::new(&mut file).include_header(true).finish(&mut frame)?;
        info!("Report written to {}", path.display());
        Ok(path)
    }

    pub fn print(&self) -> Result<(), MonitoringError> {
        println!("{}", self.to_frame()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::EnergySource;
    use tempfile::TempDir;

    fn report() -> Report {
        let estimate = EmissionEstimate::reduce(
            3600.0,
            Measurement::approximate(EnergySource::Cpu, 0.065, 3600.0),
            Measurement::no_data(EnergySource::Gpu, "no GPU samples"),
            Measurement::approximate(EnergySource::Ram, 0.006, 3600.0),
            400.0,
        );
        Report::new("climate", estimate, 1.2)
    }

    #[test]
    fn test_rows_mark_missing_and_approximate_sources() {
        let rows = report().rows();
        assert_eq!(rows.len(), 9);
        assert_eq!(rows[0], ("Project_name", "climate".to_string()));
        assert_eq!(rows[2].1, "0.065 (approximate)");
        assert_eq!(rows[3].1, "no data");
        assert_eq!(rows[8], ("PUE", "1.2".to_string()));
    }

    #[test]
    fn test_frame_shape() {
        let frame = report().to_frame().unwrap();
        assert_eq!(frame.shape(), (9, 2));
        assert_eq!(frame.get_column_names_str(), vec!["Metric", "Value"]);
    }

    #[test]
    fn test_write_csv() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("monitoring_output");
        let path = report().write_csv(&out).unwrap();
        assert_eq!(path, out.join("climate.csv"));

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("Metric,Value"));
        assert_eq!(lines.next(), Some("Project_name,climate"));
        assert!(content.contains("GPU Energy (kWh),no data"));
        assert!(content.contains("Total Carbon Emission (g/CO2 Eq),"));
    }
}

//! Project configuration store (`conf.json`).

use crate::utils::errors::MonitoringError;
use log::debug;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "conf.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitoringMode {
    /// Spawn the workload and watch its output.
    #[serde(rename = "bash mode")]
    Wrapped,
    /// Watch the process table for an already-launched workload.
    #[serde(rename = "direct mode")]
    Direct,
}

/// What bounds the window of a wrapped workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrappingMode {
    KeyString,
    WholeProcess,
}

impl WrappingMode {
    fn code(self) -> u8 {
        match self {
            WrappingMode::KeyString => 1,
            WrappingMode::WholeProcess => 2,
        }
    }
}

/// Numbers that may be stored as numbers, numeric strings, `""` or `null`.
mod lenient {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw<T> {
        Value(T),
        Text(String),
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + FromStr,
        T::Err: Display,
    {
        match Option::<Raw<T>>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Value(value)) => Ok(Some(value)),
            Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
            Some(Raw::Text(text)) => text
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("invalid number {:?}: {}", text, e))),
        }
    }

    pub fn serialize<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(value) => value.serialize(serializer),
            None => serializer.serialize_str(""),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WrappingSettings {
    #[serde(default)]
    pub process_based_model_dir: String,
    #[serde(default)]
    pub process_based_model_cmd: String,
    /// 1 = key strings, 2 = whole process.
    #[serde(default, with = "lenient")]
    pub bash_mode_wrapping_mode: Option<u8>,
    #[serde(default)]
    pub model_start_keystring: String,
    #[serde(default)]
    pub model_end_keystring: String,
    /// Seconds between process-table polls in direct mode.
    #[serde(default, with = "lenient")]
    pub detecting_interval: Option<f64>,
    #[serde(default)]
    pub process_running_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    pub monitoring_mode: MonitoringMode,
    #[serde(default)]
    pub cpu_info: String,
    #[serde(default, with = "lenient")]
    pub cpu_tdp: Option<f64>,
    /// Installed RAM in GB.
    #[serde(default, with = "lenient")]
    pub ram_info: Option<f64>,
    #[serde(default)]
    pub gpu_info: serde_json::Value,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    /// gCO2eq per kWh.
    #[serde(default, with = "lenient")]
    pub grid_carbon_intensity: Option<f64>,
    #[serde(rename = "PUE", default, with = "lenient")]
    pub pue: Option<f64>,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub model_wrapping_settings: WrappingSettings,
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>, monitoring_mode: MonitoringMode) -> Self {
        Self {
            name: name.into(),
            monitoring_mode,
            cpu_info: String::new(),
            cpu_tdp: None,
            ram_info: None,
            gpu_info: serde_json::Value::Null,
            region: None,
            country: None,
            grid_carbon_intensity: None,
            pue: None,
            model_name: String::new(),
            model_wrapping_settings: WrappingSettings::default(),
        }
    }

    pub fn with_wrapping_mode(mut self, mode: WrappingMode) -> Self {
        self.model_wrapping_settings.bash_mode_wrapping_mode = Some(mode.code());
        self
    }

    /// Explicit mode when stored, otherwise inferred from the marker strings.
    pub fn wrapping_mode(&self) -> WrappingMode {
        let settings = &self.model_wrapping_settings;
        match settings.bash_mode_wrapping_mode {
            Some(1) => WrappingMode::KeyString,
            Some(2) => WrappingMode::WholeProcess,
            _ if settings.model_start_keystring.is_empty() && settings.model_end_keystring.is_empty() => {
                WrappingMode::WholeProcess
            }
            _ => WrappingMode::KeyString,
        }
    }

    pub fn model_dir(&self) -> Option<&Path> {
        let dir = self.model_wrapping_settings.process_based_model_dir.as_str();
        (!dir.is_empty()).then(|| Path::new(dir))
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.model_wrapping_settings
            .detecting_interval
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Power usage effectiveness, 1.0 when unset.
    pub fn pue(&self) -> f64 {
        self.pue.unwrap_or(1.0)
    }

    /// Check that everything a run needs is present.
    pub fn validate(&self) -> Result<(), MonitoringError> {
        let settings = &self.model_wrapping_settings;
        let invalid = |reason: &str| Err(MonitoringError::Config(format!("project '{}': {}", self.name, reason)));
        match self.monitoring_mode {
            MonitoringMode::Direct => {
                if settings.process_running_name.trim().is_empty() {
                    return invalid("direct mode needs process_running_name");
                }
                if self.poll_interval().is_none() {
                    return invalid("direct mode needs a positive detecting_interval");
                }
            }
            MonitoringMode::Wrapped => {
                if settings.process_based_model_cmd.trim().is_empty() {
                    return invalid("bash mode needs process_based_model_cmd");
                }
                if self.wrapping_mode() == WrappingMode::KeyString
                    && settings.model_start_keystring.is_empty()
                    && settings.model_end_keystring.is_empty()
                {
                    return invalid("key string wrapping needs start or end key strings");
                }
            }
        }
        match self.grid_carbon_intensity {
            Some(intensity) if intensity.is_finite() && intensity >= 0.0 => {}
            Some(_) => return invalid("grid_carbon_intensity must be a non-negative number"),
            None => return invalid("grid_carbon_intensity has not been resolved"),
        }
        if let Some(tdp) = self.cpu_tdp {
            if !(tdp.is_finite() && tdp > 0.0) {
                return invalid("cpu_tdp must be positive");
            }
        }
        Ok(())
    }
}

/// All configured projects, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectStore {
    #[serde(rename = "Projects", default)]
    projects: BTreeMap<String, ProjectConfig>,
}

impl ProjectStore {
    pub fn load(path: &Path) -> Result<Self, MonitoringError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MonitoringError::Config(format!("configuration file {} is not available: {}", path.display(), e))
        })?;
        let store: Self = serde_json::from_str(&content)?;
        debug!("Loaded {} project(s) from {}", store.projects.len(), path.display());
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<(), MonitoringError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!("Saved {} project(s) to {}", self.projects.len(), path.display());
        Ok(())
    }

    pub fn project_names(&self) -> Vec<&str> {
        self.projects.keys().map(String::as_str).collect()
    }

    pub fn project(&self, name: &str) -> Result<&ProjectConfig, MonitoringError> {
        self.projects.get(name).ok_or_else(|| {
            MonitoringError::Config(format!(
                "no project named '{}' (known: {})",
                name,
                self.project_names().join(", ")
            ))
        })
    }

    /// Add or replace a project. Returns the replaced entry.
    pub fn insert(&mut self, project: ProjectConfig) -> Option<ProjectConfig> {
        self.projects.insert(project.name.clone(), project)
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

pub mod utils {
    pub mod errors;
    pub mod logger;
    pub mod psutils;
}

pub mod config;
pub mod coordinator;
pub mod monitor;
pub mod reconcile;
pub mod report;
pub mod sessions;
pub mod watchers;
pub mod window;

pub use config::{MonitoringMode, ProjectConfig, ProjectStore};
pub use coordinator::WindowCoordinator;
pub use monitor::{RunOptions, run_project};
pub use report::Report;
pub use utils::errors::MonitoringError;

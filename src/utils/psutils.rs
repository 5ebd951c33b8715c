use crate::utils::errors::MonitoringError;
use log::trace;
use sysinfo::{Process, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use users::{Users, UsersCache};

/// Linux reports at most this many bytes of a process name (the `comm` field).
const COMM_NAME_LIMIT: usize = 15;

/// Utility function to resolve a user ID to a username
pub fn resolve_username(uid: u32, users_cache: &UsersCache) -> String {
    users_cache
        .get_user_by_uid(uid)
        .map(|user| user.name().to_string_lossy().to_string())
        .unwrap_or_else(|| uid.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    pub user: String,
}

impl ProcessEntry {
    /// Exact name match, tolerating the kernel's truncated `comm` names.
    pub fn matches(&self, process_name: &str) -> bool {
        self.name == process_name
            || (self.name.len() == COMM_NAME_LIMIT && process_name.starts_with(&self.name))
    }
}

/// A source of process-table snapshots.
pub trait ProcessTable: Send {
    /// Refresh and return every readable entry. Unreadable entries are skipped.
    fn snapshot(&mut self) -> Vec<ProcessEntry>;
}

/// Process table backed by `sysinfo`.
pub struct SystemProcessTable {
    system: System,
    users_cache: UsersCache,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            users_cache: UsersCache::new(),
        }
    }

    fn read_entry(&self, pid: u32, process: &Process) -> Result<ProcessEntry, MonitoringError> {
        let name = process
            .name()
            .to_str()
            .ok_or_else(|| MonitoringError::ProcessRead {
                pid,
                reason: "process name is not valid UTF-8".to_string(),
            })?
            .to_string();
        let user = process
            .user_id()
            .map(|uid| resolve_username(**uid, &self.users_cache))
            .unwrap_or_else(|| "unknown".to_string());
        Ok(ProcessEntry { pid, name, user })
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn snapshot(&mut self) -> Vec<ProcessEntry> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_user(UpdateKind::OnlyIfNotSet),
        );

        self.system
            .processes()
            .iter()
            .filter_map(|(pid, process)| match self.read_entry(pid.as_u32(), process) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    trace!("Skipping process entry: {}", err);
                    None
                }
            })
            .collect()
    }
}

/// Total installed memory in whole gigabytes.
pub fn total_memory_gb() -> f64 {
    let mut system = System::new();
    system.refresh_memory();
    (system.total_memory() as f64 / 1024f64.powi(3)).round()
}

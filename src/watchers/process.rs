use crate::utils::errors::MonitoringError;
use crate::utils::psutils::{ProcessTable, SystemProcessTable};
use crate::watchers::Watcher;
use crate::window::{EndReason, WindowSignal, WorkloadWindow};
use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

/// Direct-mode watcher: polls the process table for a named process.
///
/// The first sighting starts the window. The first full poll without the
/// process, after it was seen, ends it. A process that never shows up keeps
/// the watcher polling forever; callers wanting a deadline wrap `observe` in
/// a timeout.
pub struct ProcessWatcher<T: ProcessTable = SystemProcessTable> {
    process_name: String,
    poll_interval: Duration,
    table: T,
}

impl ProcessWatcher<SystemProcessTable> {
    pub fn new(process_name: impl Into<String>, poll_interval: Duration) -> Self {
        Self::with_table(SystemProcessTable::new(), process_name, poll_interval)
    }
}

impl<T: ProcessTable> ProcessWatcher<T> {
    pub fn with_table(table: T, process_name: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            process_name: process_name.into(),
            poll_interval,
            table,
        }
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }
}

#[async_trait]
impl<T: ProcessTable + 'static> Watcher for ProcessWatcher<T> {
    async fn observe(mut self, signal: Arc<WindowSignal>) -> Result<WorkloadWindow, MonitoringError> {
        info!(
            "Waiting for process '{}' (polling every {:?})",
            self.process_name, self.poll_interval
        );
        let mut seen = false;
        let mut polls: u64 = 0;

        loop {
            polls += 1;
            let entries = self.table.snapshot();
            match entries.iter().find(|entry| entry.matches(&self.process_name)) {
                Some(entry) => {
                    if !seen {
                        seen = true;
                        info!(
                            "Process {} has started (pid {}, user {})",
                            self.process_name, entry.pid, entry.user
                        );
                        signal.start();
                    }
                }
                None if seen => {
                    info!("Process {} has terminated after {} polls", self.process_name, polls);
                    signal.end(EndReason::ProcessExited);
                    return Ok(signal.window());
                }
                None => debug!("Process {} not running yet", self.process_name),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::psutils::ProcessEntry;
    use crate::window::WindowEvent;
    use std::collections::VecDeque;

    /// Replays a fixed sequence of snapshots, then repeats the last one.
    struct ScriptedTable {
        frames: VecDeque<Vec<&'static str>>,
        last: Vec<&'static str>,
    }

    impl ScriptedTable {
        fn new(frames: Vec<Vec<&'static str>>) -> Self {
            Self {
                frames: frames.into(),
                last: Vec::new(),
            }
        }
    }

    impl ProcessTable for ScriptedTable {
        fn snapshot(&mut self) -> Vec<ProcessEntry> {
            if let Some(frame) = self.frames.pop_front() {
                self.last = frame;
            }
            self.last
                .iter()
                .enumerate()
                .map(|(i, name)| ProcessEntry {
                    pid: 100 + i as u32,
                    name: name.to_string(),
                    user: "tester".to_string(),
                })
                .collect()
        }
    }

    fn watcher(frames: Vec<Vec<&'static str>>) -> ProcessWatcher<ScriptedTable> {
        ProcessWatcher::with_table(ScriptedTable::new(frames), "model.exe", Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_start_then_end() {
        let (signal, mut rx) = WindowSignal::new();
        let frames = vec![
            vec!["init"],
            vec!["init", "model.exe"],
            vec!["model.exe", "init"],
            vec!["init"],
        ];
        let window = watcher(frames).observe(signal).await.unwrap();

        assert!(window.start.is_some());
        assert!(window.end.unwrap() >= window.start.unwrap());
        assert_eq!(window.end_reason, Some(EndReason::ProcessExited));
        assert!(matches!(rx.recv().await, Some(WindowEvent::Started(_))));
        assert!(matches!(rx.recv().await, Some(WindowEvent::Ended { .. })));
    }

    #[tokio::test]
    async fn test_never_running_blocks_without_signals() {
        let (signal, mut rx) = WindowSignal::new();
        let frames = vec![vec!["init"], vec!["init", "bash"]];
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            watcher(frames).observe(signal.clone()),
        )
        .await;

        assert!(result.is_err(), "watcher must keep polling");
        assert!(rx.try_recv().is_err());
        assert_eq!(signal.window(), WorkloadWindow::default());
    }

    #[tokio::test]
    async fn test_repeated_sightings_start_once() {
        let (signal, mut rx) = WindowSignal::new();
        let frames = vec![
            vec!["model.exe"],
            vec!["model.exe"],
            vec!["model.exe", "model.exe"],
            vec![],
        ];
        watcher(frames).observe(signal).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], WindowEvent::Started(_)));
        assert!(matches!(events[1], WindowEvent::Ended { .. }));
    }

    #[tokio::test]
    async fn test_observes_real_process_table() {
        // the test binary itself is running, and then its name never disappears,
        // so only the start is observable here
        let name = sysinfo::System::new_all()
            .process(sysinfo::Pid::from_u32(std::process::id()))
            .and_then(|p| p.name().to_str().map(str::to_string))
            .unwrap();
        let (signal, mut rx) = WindowSignal::new();
        let watcher = ProcessWatcher::new(name, Duration::from_millis(10));
        let _ = tokio::time::timeout(Duration::from_millis(200), watcher.observe(signal)).await;
        assert!(matches!(rx.try_recv(), Ok(WindowEvent::Started(_))));
    }
}

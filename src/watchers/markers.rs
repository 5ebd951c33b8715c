use crate::utils::errors::MonitoringError;
use crate::watchers::Watcher;
use crate::window::{EndReason, WindowSignal, WorkloadWindow};
use async_trait::async_trait;
use log::{error, info, warn};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// How a wrapped workload marks its own window.
#[derive(Debug, Clone, PartialEq)]
pub enum Markers {
    /// Substrings printed by the workload at the start and end of its work.
    KeyString { start: String, end: String },
    /// The whole child lifetime is the window.
    WholeProcess,
}

impl Markers {
    /// Empty marker strings mean the child lifetime is the window.
    pub fn from_strings(start: &str, end: &str) -> Self {
        if start.is_empty() && end.is_empty() {
            Markers::WholeProcess
        } else {
            Markers::KeyString {
                start: start.to_string(),
                end: end.to_string(),
            }
        }
    }

    /// An empty start marker matches the first line of output. An empty end
    /// marker never matches, leaving the end to the child's exit.
    fn scan(&self, line: &str, signal: &WindowSignal) {
        if let Markers::KeyString { start, end } = self {
            if line.contains(start.as_str()) {
                signal.start();
            }
            if !end.is_empty() && line.contains(end.as_str()) {
                signal.end(EndReason::EndMarker);
            }
        }
    }
}

/// Build the command for a wrapped workload.
///
/// An executable found at `dir/cmd` runs directly; anything else goes through
/// the platform shell. Either way the workload runs inside `dir`.
pub fn workload_command(dir: Option<&Path>, cmd: &str) -> Command {
    let direct = dir.map(|d| d.join(cmd)).filter(|p| p.is_file());
    let mut command = match direct {
        Some(path) => Command::new(path),
        None if cfg!(windows) => {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(cmd);
            c
        }
        None => {
            let mut c = Command::new("sh");
            c.arg("-c").arg(cmd);
            c
        }
    };
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    command
}

/// Wrapped-mode watcher: runs the workload as a child and scans its output.
pub struct MarkerWatcher {
    command: Command,
    markers: Markers,
}

impl MarkerWatcher {
    pub fn new(command: Command, markers: Markers) -> Self {
        Self { command, markers }
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }
}

/// Read one stream to exhaustion, echoing each line and testing it for markers.
async fn scan_stream<R>(stream: &'static str, reader: R, markers: Markers, signal: Arc<WindowSignal>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                info!("[{}] {}", stream, line);
                markers.scan(line, &signal);
            }
            Err(err) => {
                warn!("Reading workload {} failed: {}", stream, err);
                let err = MonitoringError::StreamIo {
                    stream: stream.to_string(),
                    reason: err.to_string(),
                };
                signal.force_end(EndReason::StreamError(err.to_string()));
                break;
            }
        }
    }
}

#[async_trait]
impl Watcher for MarkerWatcher {
    async fn observe(mut self, signal: Arc<WindowSignal>) -> Result<WorkloadWindow, MonitoringError> {
        self.command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = self.command.spawn().map_err(|e| {
            error!("Failed to launch workload: {}", e);
            e
        })?;
        info!("Workload launched with pid {:?} ({:?})", child.id(), self.markers);

        if self.markers == Markers::WholeProcess {
            signal.start();
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MonitoringError::Other("workload stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MonitoringError::Other("workload stderr was not captured".to_string()))?;

        let stdout_task = tokio::spawn(scan_stream("stdout", stdout, self.markers.clone(), signal.clone()));
        let stderr_task = tokio::spawn(scan_stream("stderr", stderr, self.markers.clone(), signal.clone()));
        let (stdout_result, stderr_result) = tokio::join!(stdout_task, stderr_task);
        for (stream, result) in [("stdout", stdout_result), ("stderr", stderr_result)] {
            if let Err(err) = result {
                signal.force_end(EndReason::StreamError(format!("{} scanner failed: {}", stream, err)));
            }
        }

        let status = child.wait().await?;
        info!("Workload exited with {}", status);

        match self.markers {
            Markers::WholeProcess => signal.end(EndReason::ProcessExited),
            Markers::KeyString { .. } => signal.force_end(EndReason::ChildExitFallback),
        };
        Ok(signal.window())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::window::WindowEvent;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn shell(script: &str) -> Command {
        workload_command(None, script)
    }

    fn markers() -> Markers {
        Markers::from_strings("INITIAL VALUES READ IN", "NORMAL TERMINATION")
    }

    fn drain(rx: &mut UnboundedReceiver<WindowEvent>) -> Vec<WindowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_markers_on_stdout_fire_once() {
        let (signal, mut rx) = WindowSignal::new();
        let script = "echo booting; echo '==> INITIAL VALUES READ IN'; echo working; \
                      echo 'NORMAL TERMINATION'; echo 'INITIAL VALUES READ IN again'; \
                      echo 'NORMAL TERMINATION again'";
        let window = MarkerWatcher::new(shell(script), markers())
            .observe(signal)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], WindowEvent::Started(_)));
        assert!(matches!(events[1], WindowEvent::Ended { reason: EndReason::EndMarker, .. }));
        assert_eq!(window.end_reason, Some(EndReason::EndMarker));
    }

    #[tokio::test]
    async fn test_markers_across_streams() {
        let (signal, mut rx) = WindowSignal::new();
        let script = "echo 'INITIAL VALUES READ IN' >&2; sleep 0.05; echo 'NORMAL TERMINATION'";
        let window = MarkerWatcher::new(shell(script), markers())
            .observe(signal)
            .await
            .unwrap();

        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(window.end_reason, Some(EndReason::EndMarker));
        assert!(window.end.unwrap() >= window.start.unwrap());
    }

    #[tokio::test]
    async fn test_missing_end_marker_falls_back_to_exit() {
        let (signal, mut rx) = WindowSignal::new();
        let script = "echo 'INITIAL VALUES READ IN'; echo 'crashed' >&2; exit 3";
        let window = MarkerWatcher::new(shell(script), markers())
            .observe(signal)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1],
            WindowEvent::Ended { reason: EndReason::ChildExitFallback, .. }
        ));
        assert!(window.is_terminal());
    }

    #[tokio::test]
    async fn test_whole_process_window() {
        let (signal, mut rx) = WindowSignal::new();
        let window = MarkerWatcher::new(shell("echo hi; sleep 0.02"), Markers::WholeProcess)
            .observe(signal)
            .await
            .unwrap();

        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(window.end_reason, Some(EndReason::ProcessExited));
    }

    #[tokio::test]
    async fn test_never_started_window_is_still_terminal() {
        let (signal, mut rx) = WindowSignal::new();
        let window = MarkerWatcher::new(shell("echo nothing to see"), markers())
            .observe(signal)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(window.start.is_none());
        assert!(window.is_terminal());
    }

    #[tokio::test]
    async fn test_empty_start_marker_opens_on_first_line() {
        let (signal, mut rx) = WindowSignal::new();
        let window = MarkerWatcher::new(shell("echo a; sleep 0.1; echo DONE"), Markers::from_strings("", "DONE"))
            .observe(signal)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], WindowEvent::Started(_)));
        assert_eq!(window.end_reason, Some(EndReason::EndMarker));
        assert!(window.elapsed_seconds().unwrap() >= 0.05);
    }

    /// Yields its bytes once, then fails every later read.
    struct BrokenPipe(Option<&'static [u8]>);

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.0.take() {
                Some(bytes) => {
                    buf.put_slice(bytes);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pipe closed",
                ))),
            }
        }
    }

    #[tokio::test]
    async fn test_stream_error_closes_window() {
        let (signal, mut rx) = WindowSignal::new();
        let reader = BrokenPipe(Some(&b"==> INITIAL VALUES READ IN\n"[..]));
        scan_stream("stdout", reader, markers(), signal.clone()).await;

        let window = signal.window();
        assert!(window.start.is_some());
        assert!(window.is_terminal());
        assert!(matches!(window.end_reason, Some(EndReason::StreamError(_))));

        // the child's later exit cannot close it again
        assert!(!signal.force_end(EndReason::ChildExitFallback));
        assert!(!signal.end(EndReason::EndMarker));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], WindowEvent::Started(_)));
        assert!(matches!(
            events[1],
            WindowEvent::Ended { reason: EndReason::StreamError(_), .. }
        ));
    }

    #[test]
    fn test_empty_markers_mean_whole_process() {
        assert_eq!(Markers::from_strings("", ""), Markers::WholeProcess);
        assert!(matches!(Markers::from_strings("go", ""), Markers::KeyString { .. }));
    }

    #[tokio::test]
    async fn test_launch_failure_is_an_error() {
        let (signal, _rx) = WindowSignal::new();
        let command = Command::new("/definitely/not/a/workload");
        let result = MarkerWatcher::new(command, markers()).observe(signal).await;
        assert!(matches!(result, Err(MonitoringError::Io(_))));
    }
}

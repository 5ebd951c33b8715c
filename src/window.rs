//! Workload window and the one-shot start/end signals that open and close it.
//!
//! Watchers own an `Arc<WindowSignal>` and fire it; the coordinator drains the
//! paired event receiver. Each transition is latched so it fires at most once,
//! "start" always precedes "end", and a closed window never reopens.

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Why a window was closed.
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// The watched process left the process table.
    ProcessExited,
    /// The configured end marker was read from the workload output.
    EndMarker,
    /// No end marker was seen; the child's own exit closed the window.
    ChildExitFallback,
    /// A watched stream failed before the end marker was seen.
    StreamError(String),
}

impl EndReason {
    /// True when the window was closed by a fallback rather than an observed end.
    pub fn is_fallback(&self) -> bool {
        matches!(self, EndReason::ChildExitFallback | EndReason::StreamError(_))
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::ProcessExited => write!(f, "process exited"),
            EndReason::EndMarker => write!(f, "end marker"),
            EndReason::ChildExitFallback => write!(f, "child exit (no end marker)"),
            EndReason::StreamError(e) => write!(f, "stream error: {}", e),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl WorkloadWindow {
    pub fn is_open(&self) -> bool {
        self.start.is_some() && self.end.is_none()
    }

    /// Once closed, a window stays closed.
    pub fn is_terminal(&self) -> bool {
        self.end.is_some()
    }

    /// Elapsed seconds between start and end, if both are set.
    pub fn elapsed_seconds(&self) -> Option<f64> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => {
                Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowEvent {
    Started(DateTime<Utc>),
    Ended {
        at: DateTime<Utc>,
        reason: EndReason,
    },
}

/// Single-fire start/end latches for one workload run.
#[derive(Debug)]
pub struct WindowSignal {
    window: Mutex<WorkloadWindow>,
    events: mpsc::UnboundedSender<WindowEvent>,
}

impl WindowSignal {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<WindowEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let signal = Self {
            window: Mutex::new(WorkloadWindow::default()),
            events,
        };
        (Arc::new(signal), rx)
    }

    /// Fire "start". Returns true only for the call that opened the window.
    pub fn start(&self) -> bool {
        let mut window = self.lock();
        if window.start.is_some() || window.is_terminal() {
            return false;
        }
        let now = Utc::now();
        window.start = Some(now);
        info!("Workload window started at {}", now);
        // receiver gone means nobody is coordinating; the window still records it
        let _ = self.events.send(WindowEvent::Started(now));
        true
    }

    /// Fire an observed "end". Ignored unless the window is open.
    pub fn end(&self, reason: EndReason) -> bool {
        let mut window = self.lock();
        if !window.is_open() {
            if window.start.is_none() {
                warn!("Ignoring end signal ({}) before workload start", reason);
            }
            return false;
        }
        self.close(&mut window, reason);
        true
    }

    /// Close the window whatever its state, so that it is always terminal.
    /// A window that never started is closed without a start timestamp.
    pub fn force_end(&self, reason: EndReason) -> bool {
        let mut window = self.lock();
        if window.is_terminal() {
            return false;
        }
        if window.start.is_none() {
            warn!("Workload window closed before it started ({})", reason);
        }
        self.close(&mut window, reason);
        true
    }

    pub fn window(&self) -> WorkloadWindow {
        self.lock().clone()
    }

    fn close(&self, window: &mut WorkloadWindow, reason: EndReason) {
        let now = match window.start {
            Some(start) => Utc::now().max(start),
            None => Utc::now(),
        };
        window.end = Some(now);
        window.end_reason = Some(reason.clone());
        if reason.is_fallback() {
            warn!("Workload window closed by fallback: {}", reason);
        } else {
            info!("Workload window ended at {} ({})", now, reason);
        }
        let _ = self.events.send(WindowEvent::Ended { at: now, reason });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WorkloadWindow> {
        // a poisoned window is still the last consistent state
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

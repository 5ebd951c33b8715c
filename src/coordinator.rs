use crate::sessions::{SamplingSession, SessionState};
use crate::utils::errors::MonitoringError;
use crate::watchers::Watcher;
use crate::window::{WindowEvent, WindowSignal, WorkloadWindow};
use log::{debug, error, info, warn};

/// Binds one watcher to a set of sampling sessions for a single run.
///
/// Sessions are armed together on the window's start signal and disarmed
/// together on its end. Whatever way the run finishes, every session is
/// disarmed (and its log flushed) before `run` returns.
pub struct WindowCoordinator {
    sessions: Vec<Box<dyn SamplingSession>>,
}

impl WindowCoordinator {
    pub fn new(sessions: Vec<Box<dyn SamplingSession>>) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &[Box<dyn SamplingSession>] {
        &self.sessions
    }

    pub fn into_sessions(self) -> Vec<Box<dyn SamplingSession>> {
        self.sessions
    }

    pub async fn run<W: Watcher>(&mut self, watcher: W) -> Result<WorkloadWindow, MonitoringError> {
        let (signal, mut events) = WindowSignal::new();
        let mut observer = tokio::spawn(watcher.observe(signal.clone()));

        let joined = loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => {
                    if let Err(err) = self.handle(event).await {
                        error!("Sampling sessions failed, stopping the run: {}", err);
                        observer.abort();
                        let _ = self.disarm_all().await;
                        return Err(err);
                    }
                }
                joined = &mut observer => break joined,
            }
        };

        // events fired just before the watcher returned
        while let Ok(event) = events.try_recv() {
            if let Err(err) = self.handle(event).await {
                let _ = self.disarm_all().await;
                return Err(err);
            }
        }

        let window = match joined {
            Ok(Ok(window)) => window,
            Ok(Err(err)) => {
                error!("Watcher failed: {}", err);
                let _ = self.disarm_all().await;
                return Err(err);
            }
            Err(err) => {
                error!("Watcher task aborted: {}", err);
                let _ = self.disarm_all().await;
                return Err(MonitoringError::WatcherAborted(err.to_string()));
            }
        };

        if window.is_open() {
            warn!("Watcher returned with the window still open; stopping sessions");
        }
        self.disarm_all().await?;
        Ok(window)
    }

    async fn handle(&mut self, event: WindowEvent) -> Result<(), MonitoringError> {
        debug!("Window event: {:?}", event);
        match event {
            WindowEvent::Started(at) => {
                info!("Arming {} sampling session(s) at {}", self.sessions.len(), at);
                for session in self.sessions.iter_mut() {
                    session.arm().await?;
                }
                Ok(())
            }
            WindowEvent::Ended { at, reason } => {
                info!("Disarming sampling sessions at {} ({})", at, reason);
                self.disarm_all().await
            }
        }
    }

    /// Disarm every session, even when some fail. Returns the first failure.
    async fn disarm_all(&mut self) -> Result<(), MonitoringError> {
        let mut first_error = None;
        for session in self.sessions.iter_mut() {
            if session.state() == SessionState::Disarmed {
                continue;
            }
            if let Err(err) = session.disarm().await {
                error!("Failed to stop {} sampling: {}", session.source(), err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

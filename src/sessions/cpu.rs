use crate::reconcile::{CPU_ELAPSED_LABEL, CPU_ENERGY_LABEL, EnergySource};
use crate::sessions::{SamplingLoop, SamplingSession, SessionState};
use crate::utils::errors::MonitoringError;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_RAPL_ROOT: &str = "/sys/class/powercap/intel-rapl";
pub const DEFAULT_RESOLUTION: Duration = Duration::from_millis(100);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Microjoules per milliwatt-hour.
const UJ_PER_MWH: f64 = 3_600_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuPlatform {
    Windows,
    MacOs,
    Linux,
    Other,
}

impl CpuPlatform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            CpuPlatform::Windows
        } else if cfg!(target_os = "macos") {
            CpuPlatform::MacOs
        } else if cfg!(target_os = "linux") {
            CpuPlatform::Linux
        } else {
            CpuPlatform::Other
        }
    }
}

/// Intel Power Gadget's `PowerLog` command-line logger.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerLogTool {
    executable: PathBuf,
}

impl PowerLogTool {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Find the platform's PowerLog on `PATH`, then at its default install path.
    pub fn locate(platform: CpuPlatform) -> Result<Self, MonitoringError> {
        let (name, fallback) = match platform {
            CpuPlatform::Windows => (
                "PowerLog3.0.exe",
                "C:\\Program Files\\Intel\\Power Gadget 3.6\\PowerLog3.0.exe",
            ),
            CpuPlatform::MacOs => ("PowerLog", "/Applications/Intel Power Gadget/PowerLog"),
            _ => {
                return Err(MonitoringError::ToolUnavailable(format!(
                    "Intel Power Gadget is not supported on {:?}",
                    platform
                )));
            }
        };

        find_on_path(name)
            .or_else(|| Some(PathBuf::from(fallback)).filter(|p| p.is_file()))
            .map(Self::new)
            .ok_or_else(|| {
                MonitoringError::ToolUnavailable(format!(
                    "Intel Power Gadget executable not found on {:?}",
                    platform
                ))
            })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn command(&self, resolution: Duration, log_path: &Path) -> Command {
        let mut command = Command::new(&self.executable);
        command
            .arg("-resolution")
            .arg(resolution.as_millis().to_string())
            .arg("-file")
            .arg(log_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[derive(Debug, Clone, PartialEq)]
struct RaplZone {
    energy_path: PathBuf,
    max_range_uj: u64,
}

/// Package-level RAPL energy counters under the powercap sysfs tree.
#[derive(Debug, Clone, PartialEq)]
pub struct RaplDomains {
    zones: Vec<RaplZone>,
}

impl RaplDomains {
    /// Collect readable `intel-rapl:N` package domains below `root`.
    pub fn locate(root: &Path) -> Result<Self, MonitoringError> {
        let unavailable =
            || MonitoringError::ToolUnavailable(format!("No readable RAPL package domains under {}", root.display()));
        let entries = std::fs::read_dir(root).map_err(|_| unavailable())?;

        let mut zones: Vec<RaplZone> = entries
            .filter_map(Result::ok)
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.starts_with("intel-rapl:") && name.matches(':').count() == 1
            })
            .filter_map(|entry| {
                let dir = entry.path();
                let energy_path = dir.join("energy_uj");
                read_counter(&energy_path).ok()?;
                let max_range_uj = read_counter(&dir.join("max_energy_range_uj")).unwrap_or(u64::MAX);
                Some(RaplZone {
                    energy_path,
                    max_range_uj,
                })
            })
            .collect();
        zones.sort_by(|a, b| a.energy_path.cmp(&b.energy_path));

        if zones.is_empty() {
            return Err(unavailable());
        }
        Ok(Self { zones })
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    fn read(&self) -> Result<Vec<u64>, MonitoringError> {
        self.zones.iter().map(|zone| read_counter(&zone.energy_path)).collect()
    }
}

fn read_counter(path: &Path) -> Result<u64, MonitoringError> {
    let raw = std::fs::read_to_string(path)?;
    raw.trim()
        .parse::<u64>()
        .map_err(|e| MonitoringError::Other(format!("Bad counter in {}: {}", path.display(), e)))
}

/// Energy delta between two counter readings, accounting for wraparound.
fn counter_delta(previous: u64, current: u64, max_range: u64) -> u64 {
    if current >= previous {
        current - previous
    } else {
        max_range.saturating_sub(previous).saturating_add(current)
    }
}

/// How CPU energy is obtained for a run. Chosen once at startup.
#[derive(Debug, Clone, PartialEq)]
pub enum CpuBackend {
    /// External Intel Power Gadget logger (Windows, macOS).
    PowerLog(PowerLogTool),
    /// Linux powercap counters, sampled in-process.
    Rapl(RaplDomains),
    /// No measurement: rated power over the window. Approximate by construction.
    RatedTdp { watts: f64 },
}

impl CpuBackend {
    /// Pick the measuring backend for this machine.
    ///
    /// CPUs the vendor tools cannot read (AMD) get the rated-TDP model. Any
    /// other missing tool is an error, never a silent downgrade.
    pub fn select(cpu_info: &str, cpu_tdp: Option<f64>) -> Result<Self, MonitoringError> {
        if cpu_info.to_lowercase().contains("amd") {
            let watts = cpu_tdp.ok_or_else(|| {
                MonitoringError::Config(format!("CPU '{}' needs a rated TDP for estimation", cpu_info))
            })?;
            return Ok(CpuBackend::RatedTdp { watts });
        }
        match CpuPlatform::current() {
            CpuPlatform::Linux => RaplDomains::locate(Path::new(DEFAULT_RAPL_ROOT)).map(CpuBackend::Rapl),
            platform => PowerLogTool::locate(platform).map(CpuBackend::PowerLog),
        }
    }

    pub fn is_approximate(&self) -> bool {
        matches!(self, CpuBackend::RatedTdp { .. })
    }
}

enum Running {
    Tool(Child),
    Rapl(SamplingLoop<()>),
    Timer,
}

/// Measures CPU energy for the span between `arm` and `disarm`.
pub struct CpuSession {
    backend: CpuBackend,
    log_path: PathBuf,
    resolution: Duration,
    grace_period: Duration,
    state: SessionState,
    running: Option<Running>,
    armed_at: Option<Instant>,
    elapsed: Option<Duration>,
}

impl CpuSession {
    pub fn new(backend: CpuBackend, log_path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            log_path: log_path.into(),
            resolution: DEFAULT_RESOLUTION,
            grace_period: DEFAULT_GRACE_PERIOD,
            state: SessionState::Idle,
            running: None,
            armed_at: None,
            elapsed: None,
        }
    }

    pub fn with_resolution(mut self, resolution: Duration) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn backend(&self) -> &CpuBackend {
        &self.backend
    }

    /// Time between arm and disarm, once disarmed.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn reset(&mut self) -> Result<(), MonitoringError> {
        if self.state == SessionState::Armed {
            return Err(MonitoringError::Other("cannot reset an armed CPU session".to_string()));
        }
        self.armed_at = None;
        self.elapsed = None;
        self.state = SessionState::Idle;
        Ok(())
    }

    fn unavailable(&self, reason: impl ToString) -> MonitoringError {
        MonitoringError::SamplingUnavailable {
            source_name: "cpu".to_string(),
            reason: reason.to_string(),
        }
    }

    async fn prepare_log_dir(&self) -> Result<(), MonitoringError> {
        if let Some(parent) = self.log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

/// Ask the tool to exit so it writes its summary, then force-kill after `grace`.
async fn terminate_gracefully(child: &mut Child, grace: Duration) -> Result<(), MonitoringError> {
    if let Ok(Some(status)) = child.try_wait() {
        warn!("CPU logging tool had already exited with {}", status);
        return Ok(());
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain signal delivery to a child we spawned and have not reaped
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    // no SIGTERM on Windows: start_kill is an immediate TerminateProcess, so
    // the grace period below never applies and PowerLog writes no summary
    #[cfg(not(unix))]
    {
        child.start_kill()?;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            let status = status?;
            info!("Successfully terminated the logging process ({})", status);
        }
        Err(_) => {
            warn!("Logging process did not terminate in time, killing it");
            child.kill().await?;
        }
    }
    Ok(())
}

async fn write_rapl_summary(
    writer: &mut BufWriter<File>,
    elapsed: Duration,
    total_uj: u64,
) -> Result<(), MonitoringError> {
    let summary = format!(
        "{} = {:.3}\n{} = {:.6}\n",
        CPU_ELAPSED_LABEL,
        elapsed.as_secs_f64(),
        CPU_ENERGY_LABEL,
        total_uj as f64 / UJ_PER_MWH
    );
    writer.write_all(summary.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn run_rapl_loop(
    domains: RaplDomains,
    resolution: Duration,
    mut writer: BufWriter<File>,
    token: CancellationToken,
) -> Result<(), MonitoringError> {
    let started = Instant::now();
    let mut previous = domains.read()?;
    let mut total_uj: u64 = 0;
    let mut ticker = tokio::time::interval(resolution);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        let cancelled = tokio::select! {
            biased;
            _ = token.cancelled() => true,
            _ = ticker.tick() => false,
        };

        match domains.read() {
            Ok(current) => {
                for ((prev, now), zone) in previous.iter().zip(&current).zip(&domains.zones) {
                    total_uj = total_uj.saturating_add(counter_delta(*prev, *now, zone.max_range_uj));
                }
                previous = current;
                debug!("RAPL cumulative energy {} uJ", total_uj);
            }
            // keep the last good reading; the next tick covers the gap
            Err(err) => warn!("Skipping RAPL reading: {}", err),
        }
        write_rapl_summary(&mut writer, started.elapsed(), total_uj).await?;

        if cancelled {
            break;
        }
    }
    info!(
        "RAPL sampling stopped after {:.1}s ({:.3} mWh)",
        started.elapsed().as_secs_f64(),
        total_uj as f64 / UJ_PER_MWH
    );
    Ok(())
}

#[async_trait]
impl SamplingSession for CpuSession {
    fn source(&self) -> EnergySource {
        EnergySource::Cpu
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn log_path(&self) -> &Path {
        &self.log_path
    }

    async fn arm(&mut self) -> Result<(), MonitoringError> {
        match self.state {
            SessionState::Armed => return Ok(()),
            SessionState::Disarmed => {
                warn!("CPU session already finished; ignoring arm request");
                return Ok(());
            }
            SessionState::Idle => {}
        }

        let running = match &self.backend {
            CpuBackend::PowerLog(tool) => {
                self.prepare_log_dir().await.map_err(|e| self.unavailable(e))?;
                let child = tool
                    .command(self.resolution, &self.log_path)
                    .spawn()
                    .map_err(|e| self.unavailable(format!("{}: {}", tool.executable().display(), e)))?;
                info!(
                    "Started {} (pid {:?}), logging to {}",
                    tool.executable().display(),
                    child.id(),
                    self.log_path.display()
                );
                Running::Tool(child)
            }
            CpuBackend::Rapl(domains) => {
                self.prepare_log_dir().await.map_err(|e| self.unavailable(e))?;
                let writer = File::create(&self.log_path)
                    .await
                    .map(BufWriter::new)
                    .map_err(|e| self.unavailable(e))?;
                let domains = domains.clone();
                let resolution = self.resolution;
                info!(
                    "Started RAPL sampling of {} package domain(s), logging to {}",
                    domains.len(),
                    self.log_path.display()
                );
                Running::Rapl(SamplingLoop::spawn(move |token| {
                    run_rapl_loop(domains, resolution, writer, token)
                }))
            }
            CpuBackend::RatedTdp { watts } => {
                info!("No CPU power logger; estimating from rated TDP of {} W", watts);
                Running::Timer
            }
        };

        self.running = Some(running);
        self.armed_at = Some(Instant::now());
        self.state = SessionState::Armed;
        Ok(())
    }

    async fn disarm(&mut self) -> Result<(), MonitoringError> {
        let previous = std::mem::replace(&mut self.state, SessionState::Disarmed);
        if previous != SessionState::Armed {
            return Ok(());
        }
        self.elapsed = self.armed_at.map(|at| at.elapsed());

        match self.running.take() {
            Some(Running::Tool(mut child)) => terminate_gracefully(&mut child, self.grace_period).await?,
            Some(Running::Rapl(sampling)) => sampling.stop().await?,
            Some(Running::Timer) | None => {}
        }
        info!(
            "Stopped CPU power sampling after {:.2}s",
            self.elapsed.unwrap_or_default().as_secs_f64()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::parse_cpu_log;
    use tempfile::TempDir;

    fn fake_rapl(dir: &Path, energy_uj: u64) -> PathBuf {
        let zone = dir.join("intel-rapl:0");
        std::fs::create_dir_all(zone.join("intel-rapl:0:0")).unwrap();
        std::fs::write(zone.join("energy_uj"), energy_uj.to_string()).unwrap();
        std::fs::write(zone.join("max_energy_range_uj"), "262143328850").unwrap();
        zone.join("energy_uj")
    }

    #[test]
    fn test_counter_delta_wraps() {
        assert_eq!(counter_delta(100, 250, 1_000), 150);
        assert_eq!(counter_delta(900, 100, 1_000), 200);
    }

    #[test]
    fn test_rapl_locate_skips_subzones() {
        let dir = TempDir::new().unwrap();
        fake_rapl(dir.path(), 10);
        let domains = RaplDomains::locate(dir.path()).unwrap();
        assert_eq!(domains.len(), 1);
    }

    #[test]
    fn test_rapl_locate_missing_is_tool_unavailable() {
        let dir = TempDir::new().unwrap();
        let result = RaplDomains::locate(&dir.path().join("nope"));
        assert!(matches!(result, Err(MonitoringError::ToolUnavailable(_))));
    }

    #[test]
    fn test_amd_selects_rated_tdp() {
        let backend = CpuBackend::select("AMD Ryzen 9 5900X 12-Core Processor", Some(105.0)).unwrap();
        assert_eq!(backend, CpuBackend::RatedTdp { watts: 105.0 });
        assert!(backend.is_approximate());
        assert!(matches!(
            CpuBackend::select("AMD EPYC 7763", None),
            Err(MonitoringError::Config(_))
        ));
    }

    #[test]
    fn test_power_gadget_unsupported_platform() {
        assert!(matches!(
            PowerLogTool::locate(CpuPlatform::Linux),
            Err(MonitoringError::ToolUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_rapl_session_logs_cumulative_energy() {
        let dir = TempDir::new().unwrap();
        let counter = fake_rapl(dir.path(), 1_000_000);
        let domains = RaplDomains::locate(dir.path()).unwrap();
        let log_path = dir.path().join("cpu.log");
        let mut session =
            CpuSession::new(CpuBackend::Rapl(domains), &log_path).with_resolution(Duration::from_millis(5));

        session.arm().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // one milliwatt-hour
        std::fs::write(&counter, "4600000").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.disarm().await.unwrap();

        let reading = parse_cpu_log(&log_path).unwrap();
        assert!((reading.energy_mwh.unwrap() - 1.0).abs() < 1e-9);
        assert!(reading.elapsed_seconds.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_rated_tdp_session_measures_window() {
        let dir = TempDir::new().unwrap();
        let mut session = CpuSession::new(CpuBackend::RatedTdp { watts: 65.0 }, dir.path().join("cpu.log"));
        session.arm().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.disarm().await.unwrap();
        session.disarm().await.unwrap();

        assert_eq!(session.state(), SessionState::Disarmed);
        assert!(session.elapsed().unwrap() >= Duration::from_millis(20));
        assert!(!session.log_path().exists());
    }

    #[tokio::test]
    async fn test_launch_failure_is_sampling_unavailable() {
        let dir = TempDir::new().unwrap();
        let tool = PowerLogTool::new(dir.path().join("PowerLog"));
        let mut session = CpuSession::new(CpuBackend::PowerLog(tool), dir.path().join("cpu.log"));
        let result = session.arm().await;
        assert!(matches!(result, Err(MonitoringError::SamplingUnavailable { .. })));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[cfg(unix)]
    fn fake_power_log(dir: &Path, on_term: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = format!(
            "#!/bin/sh\nout=\"$4\"\ntrap '{on_term}' TERM\n\
             echo \"Cumulative Processor Energy_0 (mWh) = 500\" > \"$out\"\n\
             while true; do sleep 0.01; done\n"
        );
        let path = dir.join("PowerLog");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_power_log_terminates_gracefully() {
        let dir = TempDir::new().unwrap();
        let on_term = "echo \"Total Elapsed Time (sec) = 1.5\" >> \"$out\"; \
                       echo \"Cumulative Processor Energy_0 (mWh) = 750\" >> \"$out\"; exit 0";
        let tool = PowerLogTool::new(fake_power_log(dir.path(), on_term));
        let log_path = dir.path().join("intel_power_gadget_log.csv");
        let mut session = CpuSession::new(CpuBackend::PowerLog(tool), &log_path);

        session.arm().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        session.disarm().await.unwrap();

        let reading = parse_cpu_log(&log_path).unwrap();
        assert_eq!(reading.energy_mwh, Some(750.0));
        assert_eq!(reading.elapsed_seconds, Some(1.5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_power_log_force_killed_after_grace() {
        let dir = TempDir::new().unwrap();
        let tool = PowerLogTool::new(fake_power_log(dir.path(), ""));
        let log_path = dir.path().join("cpu.log");
        let mut session = CpuSession::new(CpuBackend::PowerLog(tool), &log_path)
            .with_grace_period(Duration::from_millis(100));

        session.arm().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        session.disarm().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));

        let reading = parse_cpu_log(&log_path).unwrap();
        assert_eq!(reading.energy_mwh, Some(500.0));
    }
}

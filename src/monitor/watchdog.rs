//! The out-of-band watchdog.
//!
//! The sandbox forks at startup: the child carries on as the supervised
//! runtime, the parent becomes the monitor and never returns. The monitor
//! samples CPU on a short interval and memory/disk on a slower one,
//! throttling CPU with suspend/resume and killing outright on memory or
//! disk violations. The two processes are linked by a pipe; if the monitor
//! dies first, the supervised side observes EOF and terminates itself
//! rather than run unsupervised.

use crate::config::types::{ExitStatus, Result, SandboxError};
use crate::config::ResourceLimits;
use crate::monitor::disk::compute_disk_use;
use crate::monitor::throttle::{CpuSample, CpuThrottle};
use crate::platform::clock::RuntimeClock;
use crate::platform::PlatformOps;
use crossbeam_channel::{unbounded, Receiver, Sender};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, fork, getpid, pipe, read, ForkResult, Pid};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// CPU sampling cadence.
const CPU_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Memory and disk are checked every this many CPU cycles.
const SLOW_CHECK_EVERY: u32 = 10;
/// Rolling-average window for the throttle.
const THROTTLE_WINDOW: usize = 10;

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    /// Permitted fraction of one core.
    pub cpu_limit: f64,
    /// Resident-memory ceiling in bytes.
    pub memory_limit: u64,
    /// On-disk ceiling in bytes for the working directory.
    pub disk_limit: u64,
    /// The sandbox working directory whose usage is metered.
    pub workdir: PathBuf,
}

impl MonitorConfig {
    pub fn from_limits(limits: &ResourceLimits, workdir: PathBuf) -> MonitorConfig {
        MonitorConfig {
            cpu_limit: limits.cpu_fraction(),
            memory_limit: limits.memory,
            disk_limit: limits.diskused,
            workdir,
        }
    }
}

/// Outcome of one monitoring cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum MonitorVerdict {
    Idle,
    Throttle(Duration),
    MemoryExceeded { used: u64, limit: u64 },
    DiskExceeded { used: u64, limit: u64 },
}

pub struct ProcessMonitor {
    platform: Arc<dyn PlatformOps>,
    clock: RuntimeClock,
    config: MonitorConfig,
    watched: Pid,
    own: Pid,
    throttle: CpuThrottle,
    /// Samples flow sampler -> throttle as explicit messages, so the
    /// throttle logic can be driven by a synthetic trace.
    samples_in: Sender<CpuSample>,
    samples_out: Receiver<CpuSample>,
    granularity: f64,
    last_wall: f64,
    resume_wall: f64,
    last_cpu: Option<f64>,
    cycle: u32,
}

impl ProcessMonitor {
    pub fn new(
        platform: Arc<dyn PlatformOps>,
        clock: RuntimeClock,
        config: MonitorConfig,
        watched: Pid,
    ) -> ProcessMonitor {
        let (samples_in, samples_out) = unbounded();
        let granularity = platform.uptime_granularity();
        let now = clock.now();
        ProcessMonitor {
            throttle: CpuThrottle::new(config.cpu_limit, THROTTLE_WINDOW),
            platform,
            clock,
            config,
            watched,
            own: getpid(),
            samples_in,
            samples_out,
            granularity,
            last_wall: now,
            resume_wall: now,
            last_cpu: None,
            cycle: 0,
        }
    }

    /// Measure the interval since the last sample. Suspended time is
    /// discounted by measuring from the later of last-sample and
    /// last-resume; an interval shorter than the clock granularity is
    /// skipped entirely rather than divided by.
    fn sample(&mut self) -> Result<Option<CpuSample>> {
        let now = self.clock.now();
        let since_last = now - self.last_wall;
        let since_resume = now - self.resume_wall;
        let elapsed = since_last.min(since_resume);
        self.last_wall = now;
        if elapsed < self.granularity {
            return Ok(None);
        }

        // The monitor's own burn counts against the sandbox too.
        let total = self.platform.process_cpu_time(self.own)?
            + self.platform.process_cpu_time(self.watched)?;
        let Some(previous) = self.last_cpu else {
            self.last_cpu = Some(total);
            return Ok(None);
        };
        self.last_cpu = Some(total);
        Ok(Some(CpuSample {
            cpu_seconds: (total - previous).max(0.0),
            wall_seconds: elapsed,
        }))
    }

    /// One monitoring cycle: sample CPU, run the throttle over any queued
    /// samples, and on the slow cadence check memory and disk.
    pub fn tick(&mut self) -> Result<MonitorVerdict> {
        if let Some(sample) = self.sample()? {
            let _ = self.samples_in.send(sample);
        }

        let mut pause = Duration::ZERO;
        while let Ok(sample) = self.samples_out.try_recv() {
            pause = pause.max(self.throttle.observe(sample));
        }

        self.cycle = self.cycle.wrapping_add(1);
        if self.cycle % SLOW_CHECK_EVERY == 0 {
            let used = self.platform.process_rss(self.watched)?;
            if used > self.config.memory_limit {
                return Ok(MonitorVerdict::MemoryExceeded {
                    used,
                    limit: self.config.memory_limit,
                });
            }

            let used = compute_disk_use(&self.config.workdir)
                .map_err(|e| SandboxError::Platform(format!("disk scan: {}", e)))?;
            if used > self.config.disk_limit {
                return Ok(MonitorVerdict::DiskExceeded {
                    used,
                    limit: self.config.disk_limit,
                });
            }
        }

        if pause > Duration::ZERO {
            Ok(MonitorVerdict::Throttle(pause))
        } else {
            Ok(MonitorVerdict::Idle)
        }
    }

    /// Act on a verdict. Returns the fatal exit when the watched process
    /// was killed; memory and disk violations are always fatal, CPU is only
    /// ever throttled.
    pub fn enforce(&mut self, verdict: MonitorVerdict) -> Option<(ExitStatus, String)> {
        match verdict {
            MonitorVerdict::Idle => {
                std::thread::sleep(CPU_POLL_INTERVAL);
                None
            }
            MonitorVerdict::Throttle(pause) => {
                if self.platform.suspend(self.watched).is_ok() {
                    std::thread::sleep(pause);
                    let _ = self.platform.resume(self.watched);
                }
                // Suspended time must never count as usage.
                self.resume_wall = self.clock.now();
                std::thread::sleep(CPU_POLL_INTERVAL);
                None
            }
            MonitorVerdict::MemoryExceeded { used, limit } => {
                let _ = self.platform.kill(self.watched);
                Some((
                    ExitStatus::ResourceViolation,
                    format!("memory use {} over limit {}", used, limit),
                ))
            }
            MonitorVerdict::DiskExceeded { used, limit } => {
                let _ = self.platform.kill(self.watched);
                Some((
                    ExitStatus::ResourceViolation,
                    format!("disk use {} over limit {}", used, limit),
                ))
            }
        }
    }

    /// The monitor loop. Exits the process when the watched process ends,
    /// when a hard limit is violated, or — fail-safe — when the monitor
    /// itself can no longer observe its charge.
    pub fn run(mut self) -> ! {
        // Some kernels attribute no usage until the child has been waited
        // on once.
        let _ = waitpid(self.watched, Some(WaitPidFlag::WNOHANG));

        loop {
            match waitpid(self.watched, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    log::info!("watched process exited with {}", code);
                    std::process::exit(code);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    log::info!("watched process killed by {}", signal);
                    std::process::exit(0);
                }
                Ok(_) => {}
                Err(nix::errno::Errno::ECHILD) => std::process::exit(0),
                Err(_) => {}
            }

            let verdict = match self.tick() {
                Ok(verdict) => verdict,
                Err(err) => {
                    // Unable to observe the sandbox. Leaving it running
                    // unsupervised is the one outcome that must not happen.
                    let _ = self.platform.kill(self.watched);
                    crate::fatal::terminate(
                        ExitStatus::MonitorDied,
                        &format!("monitor failure, killed watched process: {}", err),
                    );
                }
            };
            if let Some((status, reason)) = self.enforce(verdict) {
                crate::fatal::terminate(status, &reason);
            }
        }
    }
}

/// Handle held by the supervised side of the fork.
pub struct Supervised {
    pub monitor_pid: Pid,
}

/// Fork into supervised child and monitor parent. Returns only in the
/// child; the parent becomes the monitor loop and exits with the verdict.
///
/// Must run before any other threads are spawned: the child of a
/// multithreaded fork inherits only the calling thread.
pub fn spawn_monitored(
    platform: Arc<dyn PlatformOps>,
    clock: RuntimeClock,
    config: MonitorConfig,
) -> Result<Supervised> {
    let (link_read, link_write) = pipe().map_err(|e| SandboxError::Process(format!("pipe: {}", e)))?;

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // The write end belongs to the monitor; holding it open here
            // would mask the monitor's death.
            let _ = close(link_write);
            watch_monitor_link(link_read);
            Ok(Supervised {
                monitor_pid: nix::unistd::getppid(),
            })
        }
        Ok(ForkResult::Parent { child }) => {
            let _ = close(link_read);
            // link_write stays open for the life of the monitor; its close
            // at process death is the death notification.
            log::info!("monitoring sandbox process {}", child);
            ProcessMonitor::new(platform, clock, config, child).run()
        }
        Err(err) => {
            let _ = close(link_read);
            let _ = close(link_write);
            Err(SandboxError::Process(format!("fork: {}", err)))
        }
    }
}

/// In the supervised child: block on the pipe and die if the monitor does.
fn watch_monitor_link(link_read: std::os::unix::io::RawFd) {
    let spawned = std::thread::Builder::new()
        .name("monitor-link".to_string())
        .spawn(move || {
            let mut buf = [0u8; 8];
            let got = read(link_read, &mut buf).unwrap_or(0);
            if got == 0 {
                crate::fatal::terminate(
                    ExitStatus::MonitorDied,
                    "monitor process died; refusing to run unsupervised",
                );
            } else {
                crate::fatal::terminate(
                    ExitStatus::MonitorDied,
                    "unexpected data on the monitor link",
                );
            }
        });
    if spawned.is_err() {
        crate::fatal::thread_error("could not start the monitor link watcher");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::TcpState;
    use crate::platform::Proto;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted platform: fixed CPU/RSS readings, counted signals.
    struct ScriptedPlatform {
        cpu: Mutex<f64>,
        rss: Mutex<u64>,
        kills: AtomicUsize,
        suspends: AtomicUsize,
    }

    impl ScriptedPlatform {
        fn new(rss: u64) -> ScriptedPlatform {
            ScriptedPlatform {
                cpu: Mutex::new(0.0),
                rss: Mutex::new(rss),
                kills: AtomicUsize::new(0),
                suspends: AtomicUsize::new(0),
            }
        }
    }

    impl PlatformOps for ScriptedPlatform {
        fn process_cpu_time(&self, _pid: Pid) -> Result<f64> {
            Ok(*self.cpu.lock().unwrap())
        }
        fn process_rss(&self, _pid: Pid) -> Result<u64> {
            Ok(*self.rss.lock().unwrap())
        }
        fn system_uptime(&self) -> Result<f64> {
            Ok(0.0)
        }
        fn uptime_granularity(&self) -> f64 {
            0.0
        }
        fn suspend(&self, _pid: Pid) -> Result<()> {
            self.suspends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn resume(&self, _pid: Pid) -> Result<()> {
            Ok(())
        }
        fn kill(&self, _pid: Pid) -> Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn exists_listening_socket(&self, _: IpAddr, _: u16, _: Proto) -> Result<bool> {
            Ok(false)
        }
        fn exists_outgoing_socket(
            &self,
            _: IpAddr,
            _: u16,
            _: IpAddr,
            _: u16,
        ) -> Result<(bool, TcpState)> {
            Ok((false, TcpState::Other))
        }
    }

    fn monitor_over(
        platform: Arc<ScriptedPlatform>,
        workdir: PathBuf,
        memory_limit: u64,
        disk_limit: u64,
    ) -> ProcessMonitor {
        let config = MonitorConfig {
            cpu_limit: 0.5,
            memory_limit,
            disk_limit,
            workdir,
        };
        ProcessMonitor::new(platform, RuntimeClock::start(), config, Pid::from_raw(1))
    }

    #[test]
    fn memory_violation_kills_exactly_once() {
        let dir = TempDir::new().unwrap();
        let platform = Arc::new(ScriptedPlatform::new(2_000_000));
        let mut monitor = monitor_over(
            Arc::clone(&platform),
            dir.path().to_path_buf(),
            1_000_000,
            u64::MAX,
        );

        let mut fatal = None;
        for _ in 0..SLOW_CHECK_EVERY {
            let verdict = monitor.tick().unwrap();
            if let v @ MonitorVerdict::MemoryExceeded { .. } = verdict {
                fatal = monitor.enforce(v);
                break;
            }
        }
        let (status, _) = fatal.expect("memory violation must surface within one slow cycle");
        assert_eq!(status, ExitStatus::ResourceViolation);
        assert_eq!(platform.kills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disk_violation_kills_within_one_slow_cycle() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("blob"), vec![0u8; 10_000]).unwrap();
        let platform = Arc::new(ScriptedPlatform::new(0));
        // Limit below the file's size plus the per-file overhead.
        let mut monitor = monitor_over(
            Arc::clone(&platform),
            dir.path().to_path_buf(),
            u64::MAX,
            5_000,
        );

        let mut fatal = None;
        for _ in 0..SLOW_CHECK_EVERY {
            let verdict = monitor.tick().unwrap();
            if let v @ MonitorVerdict::DiskExceeded { .. } = verdict {
                fatal = monitor.enforce(v);
                break;
            }
        }
        let (status, _) = fatal.expect("disk violation must surface within one slow cycle");
        assert_eq!(status, ExitStatus::ResourceViolation);
        assert_eq!(platform.kills.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_process_is_never_punished() {
        let dir = TempDir::new().unwrap();
        let platform = Arc::new(ScriptedPlatform::new(0));
        let mut monitor = monitor_over(
            Arc::clone(&platform),
            dir.path().to_path_buf(),
            u64::MAX,
            u64::MAX,
        );
        for _ in 0..25 {
            let verdict = monitor.tick().unwrap();
            assert!(
                matches!(verdict, MonitorVerdict::Idle),
                "unexpected verdict {:?}",
                verdict
            );
        }
        assert_eq!(platform.kills.load(Ordering::SeqCst), 0);
        assert_eq!(platform.suspends.load(Ordering::SeqCst), 0);
    }
}

//! Supervised startup.
//!
//! `launch` wires the whole runtime together in the order the pieces
//! depend on each other: platform adapter, status side-channel, fatal
//! sinks, then the watchdog fork (the parent becomes the monitor and never
//! returns), and finally — in the supervised child — the stop-signal
//! watcher and the sandbox context itself.

use crate::config::types::{LifecycleStatus, Result, SandboxError};
use crate::config::ResourceLimits;
use crate::context::SandboxContext;
use crate::fatal::{self, FatalSink};
use crate::monitor::watchdog::{spawn_monitored, MonitorConfig};
use crate::monitor::StatusWriter;
use crate::platform::clock::RuntimeClock;
use crate::platform::select_platform;
use std::path::PathBuf;

pub struct SandboxOptions {
    pub limits: ResourceLimits,
    /// Working directory all file access and disk accounting is confined to.
    pub workdir: PathBuf,
    /// Directory and prefix for the status marker files.
    pub status: Option<(PathBuf, String)>,
    /// Path whose creation stops the sandbox from outside.
    pub stopfile: Option<PathBuf>,
    /// File receiving one JSON record per fatal event.
    pub diagnostics: Option<PathBuf>,
}

/// Start a supervised sandbox. Returns in the supervised process with the
/// context sandboxed code runs against; the calling process's other half
/// (the monitor) never returns from here.
///
/// Call before spawning any threads: the watchdog fork happens inside.
pub fn launch(options: SandboxOptions) -> Result<SandboxContext> {
    if !options.workdir.is_dir() {
        return Err(SandboxError::Config(format!(
            "working directory '{}' does not exist",
            options.workdir.display()
        )));
    }

    let platform = select_platform()?;
    let clock = RuntimeClock::start();

    let status = match &options.status {
        Some((dir, prefix)) => Some(StatusWriter::new(dir.clone(), prefix)?),
        None => None,
    };
    if let Some(status) = &status {
        status.write(LifecycleStatus::Started)?;
    }
    // Both halves of the fork inherit the sinks, so either side can record
    // the terminal state.
    fatal::install(FatalSink {
        status,
        diagnostics: options.diagnostics.clone(),
    });

    let monitor_config = MonitorConfig::from_limits(&options.limits, options.workdir.clone());
    let supervised = spawn_monitored(platform.clone(), clock, monitor_config)?;
    log::info!(
        "sandbox supervised by monitor process {}",
        supervised.monitor_pid
    );

    if let Some(stopfile) = options.stopfile {
        crate::monitor::stopfile::watch(stopfile)?;
    }

    SandboxContext::bootstrap(&options.limits, options.workdir, platform)
}

//! Unrecoverable termination.
//!
//! Everything that threatens the runtime's own integrity funnels through
//! here: hard resource caps, uncaught callback errors, internal
//! inconsistencies, monitor failure. The path writes a best-effort
//! diagnostic record and the lifecycle status, then exits the process.
//! Sandboxed code cannot intercept it.

use crate::config::types::{ExitStatus, LifecycleStatus};
use crate::monitor::status::StatusWriter;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct FatalSink {
    pub status: Option<StatusWriter>,
    pub diagnostics: Option<PathBuf>,
}

static SINK: OnceCell<FatalSink> = OnceCell::new();

/// Install the status/diagnostics sinks. Later installs are ignored; the
/// first configuration wins for the life of the process.
pub fn install(sink: FatalSink) {
    let _ = SINK.set(sink);
}

#[derive(Serialize)]
struct FatalRecord<'a> {
    exit_code: i32,
    class: &'a str,
    reason: &'a str,
    epoch_seconds: f64,
}

fn record(status: ExitStatus, reason: &str) {
    log::error!("fatal ({:?}, exit {}): {}", status, status.code(), reason);

    let Some(sink) = SINK.get() else { return };

    if let Some(path) = &sink.diagnostics {
        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let line = serde_json::to_string(&FatalRecord {
            exit_code: status.code(),
            class: &format!("{:?}", status),
            reason,
            epoch_seconds: epoch,
        })
        .unwrap_or_default();
        if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", line);
        }
    }

    if let Some(writer) = &sink.status {
        let lifecycle = match status {
            ExitStatus::Normal | ExitStatus::Stopped => LifecycleStatus::Stopped,
            ExitStatus::ThreadError => LifecycleStatus::ThreadErr,
            _ => LifecycleStatus::Terminated,
        };
        let _ = writer.write(lifecycle);
    }
}

/// Terminate the whole process with the given exit class.
pub fn terminate(status: ExitStatus, reason: &str) -> ! {
    record(status, reason);
    std::process::exit(status.code());
}

/// Terminate with a raw exit code supplied from outside (the stop-signal
/// payload). The code has no `ExitStatus` class of its own.
pub fn terminate_with_code(code: i32, lifecycle: LifecycleStatus, reason: &str) -> ! {
    log::error!("fatal (exit {}): {}", code, reason);
    if let Some(sink) = SINK.get() {
        if let Some(writer) = &sink.status {
            let _ = writer.write(lifecycle);
        }
    }
    std::process::exit(code);
}

/// An invariant the runtime itself relies on was violated.
pub fn internal_error(reason: &str) -> ! {
    terminate(ExitStatus::InternalError, reason)
}

/// A user callback escaped with a panic. Partial failure would leave the
/// sandbox claiming to enforce policy on a program that has gone off the
/// rails, so the whole process goes down.
pub fn uncaught_callback(reason: &str) -> ! {
    terminate(ExitStatus::UncaughtCallbackError, reason)
}

/// A worker thread could not be started at all.
pub fn thread_error(reason: &str) -> ! {
    terminate(ExitStatus::ThreadError, reason)
}

//! External stop signal.
//!
//! An operator (or node manager) stops the sandbox by creating a file at an
//! agreed path. The file may carry `"<exitcode>;<message>"`; anything
//! malformed degrades to the plain Stopped exit. Exit code 56 is reserved
//! for thread errors and cannot be requested from outside.

use crate::config::types::{ExitStatus, LifecycleStatus, Result, SandboxError};
use std::path::PathBuf;
use std::time::Duration;

const CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Parsed stop directive: exit code and optional operator message.
pub(crate) fn parse_stop_directive(contents: &str) -> (i32, Option<String>) {
    let fallback = (ExitStatus::Stopped.code(), None);
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return fallback;
    }
    let Some((code, message)) = trimmed.split_once(';') else {
        return fallback;
    };
    let Ok(code) = code.parse::<i32>() else {
        return fallback;
    };
    if code == ExitStatus::ThreadError.code() {
        // ThreadErr has side effects an external caller must not trigger.
        return fallback;
    }
    let message = if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    };
    (code, message)
}

/// Start watching for the stop file. The path must not exist yet; a
/// pre-existing file means a stale or conflicting deployment.
pub fn watch(path: PathBuf) -> Result<()> {
    if path.exists() {
        return Err(SandboxError::Config(format!(
            "stop file '{}' already exists",
            path.display()
        )));
    }

    let spawned = std::thread::Builder::new()
        .name("stopfile-watcher".to_string())
        .spawn(move || loop {
            if path.exists() {
                let contents = std::fs::read_to_string(&path).unwrap_or_default();
                let (code, message) = parse_stop_directive(&contents);
                if let Some(message) = &message {
                    log::warn!("stop requested: {}", message);
                }
                crate::fatal::terminate_with_code(
                    code,
                    LifecycleStatus::Stopped,
                    &format!("stop file '{}' observed", path.display()),
                );
            }
            std::thread::sleep(CHECK_INTERVAL);
        });
    if spawned.is_err() {
        crate::fatal::thread_error("could not start the stop file watcher");
    }
    Ok(())
}

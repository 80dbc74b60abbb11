//! Status side-channel.
//!
//! The coarse lifecycle state is recorded as an empty marker file named
//! `<prefix>-<status>-<epoch-seconds>`. A write creates the new marker first
//! and deletes the old ones after, so a concurrent reader always observes at
//! least one consistent, latest state.

use crate::config::types::{LifecycleStatus, Result, SandboxError};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct StatusWriter {
    dir: PathBuf,
    prefix: String,
}

impl StatusWriter {
    pub fn new(dir: PathBuf, prefix: &str) -> Result<StatusWriter> {
        if prefix.is_empty() || prefix.contains('-') || prefix.contains('/') {
            return Err(SandboxError::Config(format!(
                "status prefix '{}' must be non-empty and free of '-' and '/'",
                prefix
            )));
        }
        Ok(StatusWriter {
            dir,
            prefix: prefix.to_string(),
        })
    }

    /// Record a new lifecycle state.
    pub fn write(&self, status: LifecycleStatus) -> Result<()> {
        let stale = self.marker_files()?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let marker = self
            .dir
            .join(format!("{}-{}-{}", self.prefix, status, timestamp));
        fs::File::create(&marker)?;

        for old in stale {
            match fs::remove_file(&old) {
                Ok(()) => {}
                // Another instance already removed it.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Latest recorded state, if any.
    pub fn read(&self) -> Result<Option<(LifecycleStatus, f64)>> {
        let mut latest: Option<(LifecycleStatus, f64)> = None;
        for path in self.marker_files()? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let mut parts = name.splitn(3, '-');
            let (Some(_prefix), Some(status), Some(stamp)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let (Some(status), Ok(stamp)) =
                (LifecycleStatus::from_name(status), stamp.parse::<f64>())
            else {
                continue;
            };
            if latest.map_or(true, |(_, t)| stamp > t) {
                latest = Some((status, stamp));
            }
        }
        Ok(latest)
    }

    fn marker_files(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let parts: Vec<&str> = name.split('-').collect();
            if parts.len() == 3 && parts[0] == self.prefix {
                found.push(entry.path());
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn exactly_one_marker_survives_repeated_writes() {
        let dir = TempDir::new().unwrap();
        let writer = StatusWriter::new(dir.path().to_path_buf(), "vessel").unwrap();
        writer.write(LifecycleStatus::Started).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        writer.write(LifecycleStatus::Terminated).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        writer.write(LifecycleStatus::Stopped).unwrap();

        let markers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(markers.len(), 1);
        let (status, _) = writer.read().unwrap().unwrap();
        assert_eq!(status, LifecycleStatus::Stopped);
    }

    #[test]
    fn read_on_empty_dir_is_none() {
        let dir = TempDir::new().unwrap();
        let writer = StatusWriter::new(dir.path().to_path_buf(), "vessel").unwrap();
        assert!(writer.read().unwrap().is_none());
    }

    #[test]
    fn prefix_with_dash_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(StatusWriter::new(dir.path().to_path_buf(), "bad-prefix").is_err());
    }

    #[test]
    fn foreign_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::File::create(dir.path().join("unrelated")).unwrap();
        std::fs::File::create(dir.path().join("other-Started-1.0")).unwrap();
        let writer = StatusWriter::new(dir.path().to_path_buf(), "vessel").unwrap();
        writer.write(LifecycleStatus::Started).unwrap();
        assert!(dir.path().join("unrelated").exists());
        assert!(dir.path().join("other-Started-1.0").exists());
    }
}

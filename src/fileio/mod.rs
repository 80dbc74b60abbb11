//! Mediated file primitives.
//!
//! All file access is confined to the sandbox working directory and named
//! from a restricted alphabet, so a path can never escape or alias the
//! status/stop side-channels. Reads and writes are metered against the
//! `fileread`/`filewrite` rates with the same probe-then-charge discipline
//! as the socket layer.

use crate::config::types::{Fungible, Renewable, Result, SandboxError};
use crate::ledger::{new_token, ItemToken, ResourceLedger};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

pub type FileId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

struct FileEntry {
    name: String,
    file: File,
    reservation: ItemToken,
}

pub(crate) struct FileMediator {
    workdir: PathBuf,
    ledger: Arc<ResourceLedger>,
    table: Mutex<HashMap<FileId, FileEntry>>,
}

const FILENAME_ALPHABET: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789._-";

/// File names must stay inside the sandbox directory: restricted alphabet,
/// no separators, and never `.` or `..`.
fn validate_filename(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SandboxError::Argument("file name is empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(SandboxError::Argument(
            "file name cannot be a directory".to_string(),
        ));
    }
    for ch in name.chars() {
        if !FILENAME_ALPHABET.contains(ch) {
            return Err(SandboxError::Argument(format!(
                "file name has disallowed character '{}'",
                ch.escape_default()
            )));
        }
    }
    Ok(())
}

impl FileMediator {
    pub fn new(workdir: PathBuf, ledger: Arc<ResourceLedger>) -> FileMediator {
        FileMediator {
            workdir,
            ledger,
            table: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FileId, FileEntry>> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a file in the sandbox directory, reserving a `filesopened` slot
    /// for the handle's lifetime.
    pub fn open(&self, name: &str, mode: FileMode) -> Result<FileId> {
        validate_filename(name)?;

        let reservation = new_token();
        if let Err(err) = self.ledger.reserve_item(Fungible::FilesOpened, reservation) {
            self.ledger
                .release_item(Fungible::FilesOpened, &reservation);
            return Err(err);
        }

        let mut options = OpenOptions::new();
        match mode {
            FileMode::Read => options.read(true),
            FileMode::Write => options.write(true).create(true).truncate(true),
            FileMode::Append => options.append(true).create(true),
        };
        let file = match options.open(self.workdir.join(name)) {
            Ok(file) => file,
            Err(err) => {
                self.ledger
                    .release_item(Fungible::FilesOpened, &reservation);
                return Err(err.into());
            }
        };

        let id = Uuid::new_v4();
        self.lock().insert(
            id,
            FileEntry {
                name: name.to_string(),
                file,
                reservation,
            },
        );
        Ok(id)
    }

    /// Read up to `max` bytes at the current position.
    pub fn read(&self, id: FileId, max: usize) -> Result<Vec<u8>> {
        self.ledger.charge_renewable(Renewable::FileRead, 0.0)?;
        let mut buf = vec![0u8; max];
        let got = {
            let mut table = self.lock();
            let entry = table
                .get_mut(&id)
                .ok_or_else(|| SandboxError::Filesystem("file handle is not open".to_string()))?;
            entry.file.read(&mut buf)?
        };
        self.ledger
            .charge_renewable(Renewable::FileRead, got as f64)?;
        buf.truncate(got);
        Ok(buf)
    }

    pub fn write(&self, id: FileId, data: &[u8]) -> Result<()> {
        self.write_many(id, &[data])
    }

    /// Write several buffers back to back under one charge.
    pub fn write_many(&self, id: FileId, parts: &[&[u8]]) -> Result<()> {
        self.ledger.charge_renewable(Renewable::FileWrite, 0.0)?;
        let total: usize = parts.iter().map(|p| p.len()).sum();
        {
            let mut table = self.lock();
            let entry = table
                .get_mut(&id)
                .ok_or_else(|| SandboxError::Filesystem("file handle is not open".to_string()))?;
            for part in parts {
                entry.file.write_all(part)?;
            }
        }
        self.ledger
            .charge_renewable(Renewable::FileWrite, total as f64)?;
        Ok(())
    }

    pub fn flush(&self, id: FileId) -> Result<()> {
        let mut table = self.lock();
        let entry = table
            .get_mut(&id)
            .ok_or_else(|| SandboxError::Filesystem("file handle is not open".to_string()))?;
        entry.file.flush()?;
        Ok(())
    }

    pub fn seek(&self, id: FileId, position: SeekFrom) -> Result<u64> {
        let mut table = self.lock();
        let entry = table
            .get_mut(&id)
            .ok_or_else(|| SandboxError::Filesystem("file handle is not open".to_string()))?;
        Ok(entry.file.seek(position)?)
    }

    /// Close a handle and release its slot. Closing twice is a no-op, same
    /// as the underlying descriptor semantics.
    pub fn close(&self, id: FileId) {
        if let Some(entry) = self.lock().remove(&id) {
            self.ledger
                .release_item(Fungible::FilesOpened, &entry.reservation);
        }
    }

    /// Delete a file from the sandbox directory. Refused while any handle
    /// on the same path is open, so write-rate accounting already charged
    /// against the file cannot be dodged by deleting it.
    pub fn remove(&self, name: &str) -> Result<()> {
        validate_filename(name)?;
        {
            let table = self.lock();
            if table.values().any(|entry| entry.name == name) {
                return Err(SandboxError::Filesystem(format!(
                    "file '{}' is open and cannot be removed",
                    name
                )));
            }
        }
        std::fs::remove_file(self.workdir.join(name))?;
        Ok(())
    }

    /// Names of the files in the sandbox directory.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.workdir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Renewable;
    use crate::config::ResourceLimits;
    use crate::platform::clock::RuntimeClock;
    use tempfile::TempDir;

    fn mediator(dir: &TempDir) -> FileMediator {
        let mut limits = ResourceLimits::default();
        limits.renewable.insert(Renewable::Cpu, 0.5);
        limits.renewable.insert(Renewable::FileRead, 1e9);
        limits.renewable.insert(Renewable::FileWrite, 1e9);
        limits.fungible.insert(Fungible::FilesOpened, 2);
        limits.memory = 1;
        limits.diskused = 1;
        let ledger = Arc::new(ResourceLedger::new(&limits, RuntimeClock::start()));
        FileMediator::new(dir.path().to_path_buf(), ledger)
    }

    #[test]
    fn filename_validation() {
        assert!(validate_filename("data.log").is_ok());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename(".").is_err());
        assert!(validate_filename("a/b").is_err());
        assert!(validate_filename("a\\b").is_err());
        assert!(validate_filename("").is_err());
        assert!(validate_filename("semi;colon").is_err());
    }

    #[test]
    fn write_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let files = mediator(&dir);
        let id = files.open("out.txt", FileMode::Write).unwrap();
        files.write_many(id, &[b"hello ", b"world"]).unwrap();
        files.close(id);

        let id = files.open("out.txt", FileMode::Read).unwrap();
        let data = files.read(id, 64).unwrap();
        assert_eq!(data, b"hello world");
        files.close(id);
    }

    #[test]
    fn open_file_blocks_removal() {
        let dir = TempDir::new().unwrap();
        let files = mediator(&dir);
        let id = files.open("pinned.txt", FileMode::Write).unwrap();
        assert!(files.remove("pinned.txt").is_err());
        files.close(id);
        files.remove("pinned.txt").unwrap();
        assert!(!dir.path().join("pinned.txt").exists());
    }

    #[test]
    fn filesopened_cap_enforced() {
        let dir = TempDir::new().unwrap();
        let files = mediator(&dir);
        let a = files.open("a", FileMode::Write).unwrap();
        let _b = files.open("b", FileMode::Write).unwrap();
        assert!(matches!(
            files.open("c", FileMode::Write),
            Err(SandboxError::ResourceExceeded("filesopened"))
        ));
        files.close(a);
        files.open("c", FileMode::Write).unwrap();
    }

    #[test]
    fn closing_twice_is_harmless() {
        let dir = TempDir::new().unwrap();
        let files = mediator(&dir);
        let id = files.open("f", FileMode::Write).unwrap();
        files.close(id);
        files.close(id);
    }
}

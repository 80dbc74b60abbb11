//! On-disk usage of the sandbox working directory.

use std::io;
use std::path::Path;

/// Flat per-entry surcharge, so a program cannot hide usage in thousands of
/// tiny files that each round to nothing.
pub const PER_FILE_OVERHEAD: u64 = 4096;

/// Sum of file sizes in `dir` plus the per-entry overhead. Entries deleted
/// while the scan runs are simply skipped (they still pay the overhead for
/// having existed this cycle, matching the listing we saw).
pub fn compute_disk_use(dir: &Path) -> io::Result<u64> {
    let mut used = 0u64;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if let Ok(metadata) = entry.metadata() {
            if metadata.is_file() {
                used = used.saturating_add(metadata.len());
            }
        }
        used = used.saturating_add(PER_FILE_OVERHEAD);
    }
    Ok(used)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn empty_dir_uses_nothing() {
        let dir = TempDir::new().unwrap();
        assert_eq!(compute_disk_use(dir.path()).unwrap(), 0);
    }

    #[test]
    fn files_pay_size_plus_overhead() {
        let dir = TempDir::new().unwrap();
        let mut f = std::fs::File::create(dir.path().join("a")).unwrap();
        f.write_all(&[0u8; 1000]).unwrap();
        std::fs::File::create(dir.path().join("b")).unwrap();
        assert_eq!(
            compute_disk_use(dir.path()).unwrap(),
            1000 + 2 * PER_FILE_OVERHEAD
        );
    }

    #[test]
    fn many_tiny_files_are_not_free() {
        let dir = TempDir::new().unwrap();
        for i in 0..10 {
            std::fs::File::create(dir.path().join(format!("f{}", i))).unwrap();
        }
        assert_eq!(
            compute_disk_use(dir.path()).unwrap(),
            10 * PER_FILE_OVERHEAD
        );
    }
}

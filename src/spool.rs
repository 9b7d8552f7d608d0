//! Crash-safe on-disk result spool (C2, spec §4.2).
//!
//! A spool entry is a file named by `task_id` in `unacked_results/` whose
//! bytes are exactly what gets published. Writes go to a temp name in the
//! same directory and are renamed into place, so a crash mid-write leaves
//! only a stray `.tmp-*` file behind, never a corrupt entry (I2/I3).

use std::{
    fs,
    io::Write,
    path::PathBuf,
};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct ResultSpool {
    dir: PathBuf,
}

impl ResultSpool {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entry_path(&self, task_id: Uuid) -> PathBuf {
        self.dir.join(task_id.to_string())
    }

    fn tmp_path(&self, task_id: Uuid) -> PathBuf {
        self.dir.join(format!(".tmp-{task_id}"))
    }

    /// Persist `body` atomically; returns once the write is durable on the
    /// local filesystem (`sync_all` before rename).
    pub fn put(&self, task_id: Uuid, body: &[u8]) -> std::io::Result<()> {
        let tmp = self.tmp_path(task_id);
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(body)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, self.entry_path(task_id))
    }

    /// Idempotent: a missing file is not an error.
    pub fn delete(&self, task_id: Uuid) -> std::io::Result<()> {
        match fs::remove_file(self.entry_path(task_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn contains(&self, task_id: Uuid) -> bool {
        self.entry_path(task_id).is_file()
    }

    /// Snapshot-at-entry enumeration of pending entries. Entries created or
    /// deleted after this call are not reflected in the returned vector,
    /// matching §5's "spool-replay reads filenames snapshot-at-entry."
    pub fn iter_pending(&self) -> std::io::Result<Vec<(Uuid, PathBuf)>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(".tmp-") {
                continue;
            }
            if let Ok(id) = Uuid::parse_str(name) {
                out.push((id, path));
            }
        }
        Ok(out)
    }

    pub fn read(&self, task_id: Uuid) -> std::io::Result<Vec<u8>> {
        fs::read(self.entry_path(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_then_contains_then_delete() {
        let dir = TempDir::new().unwrap();
        let spool = ResultSpool::new(dir.path()).unwrap();
        let id = Uuid::new_v4();
        assert!(!spool.contains(id));

        spool.put(id, b"hello").unwrap();
        assert!(spool.contains(id));
        assert_eq!(spool.read(id).unwrap(), b"hello");

        spool.delete(id).unwrap();
        assert!(!spool.contains(id));
    }

    #[test]
    fn delete_missing_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let spool = ResultSpool::new(dir.path()).unwrap();
        assert!(spool.delete(Uuid::new_v4()).is_ok());
    }

    #[test]
    fn iter_pending_skips_temp_files_and_snapshots() {
        let dir = TempDir::new().unwrap();
        let spool = ResultSpool::new(dir.path()).unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        spool.put(a, b"a").unwrap();
        spool.put(b, b"b").unwrap();
        // stray temp file from a simulated crash mid-write
        fs::write(dir.path().join(".tmp-stray"), b"partial").unwrap();

        let mut pending: Vec<Uuid> = spool.iter_pending().unwrap().into_iter().map(|(id, _)| id).collect();
        pending.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(pending, expected);
    }

    #[test]
    fn put_overwrites_via_rename() {
        let dir = TempDir::new().unwrap();
        let spool = ResultSpool::new(dir.path()).unwrap();
        let id = Uuid::new_v4();
        spool.put(id, b"first").unwrap();
        spool.put(id, b"second").unwrap();
        assert_eq!(spool.read(id).unwrap(), b"second");
    }
}

//! Crash-safe persistent log, config, and snapshot files.
//!
//! Three newline-delimited-JSON files share a base path: `<base>.log`,
//! `<base>.conf`, `<base>.snapshot`. Updates to the config and snapshot
//! files, and the wholesale log replacement that comes with installing a
//! snapshot, go through a `.tmp` shadow file and an atomic rename so that a
//! crash mid-write never leaves a half-written file in the canonical
//! location. Presence of `<base>.log.tmp` on startup is the single commit
//! point of a snapshot install: if it exists, the install is promoted to
//! completion; otherwise any `.conf.tmp`/`.snapshot.tmp` orphans are
//! discarded and the pre-install files stand.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::{Error, Result};
use crate::protos::{LogEntry, PersistedConfig};

pub struct PersistentStore {
    base: PathBuf,
    log_file: File,
    /// `offsets[i]` is the byte offset in `<base>.log` at which the entry
    /// with in-memory log index `i` begins. Index 0 is the sentinel and is
    /// never written to disk, so `offsets[0]` is unused (kept as `0`) to
    /// keep indices aligned with the node's in-memory log vector.
    offsets: Vec<u64>,
}

fn path_for(base: &Path, suffix: &str) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes `dest` if present and renames `src` onto it, if `src` exists.
/// A missing `src` is not an error: not every snapshot install touches
/// every file (e.g. the very first snapshot has no prior `.conf`/
/// `.snapshot` to speak of only if they were never created, which cannot
/// happen once a node has started, but recovery must still be robust to
/// partially-written sequences).
fn atomic_swap(dest: &Path, src: &Path) -> std::io::Result<()> {
    if !src.exists() {
        return Ok(());
    }
    remove_if_exists(dest)?;
    std::fs::rename(src, dest)
}

impl PersistentStore {
    /// Opens the store at `base`, first performing crash recovery, then
    /// returns the store along with the log (including the synthesized
    /// sentinel at index 0) and the persisted config.
    pub fn open(base: impl Into<PathBuf>) -> Result<(Self, Vec<LogEntry>, PersistedConfig)> {
        let base = base.into();
        Self::recover(&base).map_err(|e| Error::io(path_for(&base, ".log.tmp"), e))?;

        let conf = Self::load_config(&base)?;

        let log_path = path_for(&base, ".log");
        let log_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)
            .map_err(|e| Error::io(&log_path, e))?;

        let (entries, offsets) = Self::load_log(&log_path)?;

        let sentinel_term = entries.last().map(|e| e.term).unwrap_or(0);
        let mut log = Vec::with_capacity(entries.len() + 1);
        log.push(LogEntry::sentinel(sentinel_term));
        log.extend(entries);

        let mut full_offsets = vec![0u64];
        full_offsets.extend(offsets);

        let store = PersistentStore {
            base,
            log_file,
            offsets: full_offsets,
        };

        Ok((store, log, conf))
    }

    fn recover(base: &Path) -> std::io::Result<()> {
        let log_tmp = path_for(base, ".log.tmp");
        if log_tmp.exists() {
            atomic_swap(&path_for(base, ".conf"), &path_for(base, ".conf.tmp"))?;
            atomic_swap(
                &path_for(base, ".snapshot"),
                &path_for(base, ".snapshot.tmp"),
            )?;
            atomic_swap(&path_for(base, ".log"), &log_tmp)?;
        } else {
            remove_if_exists(&path_for(base, ".conf.tmp"))?;
            remove_if_exists(&path_for(base, ".snapshot.tmp"))?;
        }
        Ok(())
    }

    fn load_config(base: &Path) -> Result<PersistedConfig> {
        let path = path_for(base, ".conf");
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let line = contents.lines().next().unwrap_or("");
                if line.trim().is_empty() {
                    Ok(PersistedConfig::default())
                } else {
                    Ok(serde_json::from_str(line)?)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PersistedConfig::default()),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    fn load_log(path: &Path) -> Result<(Vec<LogEntry>, Vec<u64>)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((vec![], vec![])),
            Err(e) => return Err(Error::io(path, e)),
        };
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut pos: u64 = 0;
        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .map_err(|e| Error::io(path, e))?;
            if n == 0 {
                break;
            }
            offsets.push(pos);
            pos += n as u64;
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed.is_empty() {
                offsets.pop();
                continue;
            }
            let entry: LogEntry = serde_json::from_str(trimmed)
                .map_err(|_| Error::Corrupt(format!("malformed log record at offset {}", pos)))?;
            entries.push(entry);
        }
        Ok((entries, offsets))
    }

    /// Appends one entry, assigning it the next log index. Returns the
    /// byte offset it was written at.
    pub fn append_entry(&mut self, entry: &LogEntry) -> Result<u64> {
        let path = path_for(&self.base, ".log");
        let offset = self
            .log_file
            .stream_position()
            .map_err(|e| Error::io(&path, e))?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        self.log_file
            .write_all(line.as_bytes())
            .map_err(|e| Error::io(&path, e))?;
        self.log_file.sync_data().map_err(|e| Error::io(&path, e))?;
        self.offsets.push(offset);
        Ok(offset)
    }

    /// Truncates all persisted entries with in-memory log index `>= from`,
    /// rewinding the log file to `offsets[from]`. `from` must be `>= 1`
    /// (the sentinel is never persisted and can't be truncated).
    pub fn truncate_suffix(&mut self, from: usize) -> Result<()> {
        debug_assert!(from >= 1);
        let path = path_for(&self.base, ".log");
        if from >= self.offsets.len() {
            return Ok(());
        }
        let cut = self.offsets[from];
        self.log_file
            .set_len(cut)
            .map_err(|e| Error::io(&path, e))?;
        self.log_file
            .seek(SeekFrom::Start(cut))
            .map_err(|e| Error::io(&path, e))?;
        self.offsets.truncate(from);
        Ok(())
    }

    pub fn save_config(&mut self, conf: &PersistedConfig) -> Result<()> {
        let path = path_for(&self.base, ".conf");
        let tmp_path = path_for(&self.base, ".conf.tmp");
        {
            let mut f = File::create(&tmp_path).map_err(|e| Error::io(&tmp_path, e))?;
            let mut line = serde_json::to_string(conf)?;
            line.push('\n');
            f.write_all(line.as_bytes())
                .map_err(|e| Error::io(&tmp_path, e))?;
            f.sync_all().map_err(|e| Error::io(&tmp_path, e))?;
        }
        atomic_swap(&path, &tmp_path).map_err(|e| Error::io(&path, e))
    }

    pub fn read_snapshot(&self) -> Result<Option<serde_json::Value>> {
        let path = path_for(&self.base, ".snapshot");
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let line = contents.lines().next().unwrap_or("");
                if line.trim().is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(serde_json::from_str(line)?))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }

    /// Installs a snapshot: writes the new snapshot image, the reset
    /// config, and the log tail to `.tmp` shadow files, then swaps
    /// snapshot, then config, then log into place. Swapping the log last
    /// makes its presence at startup the single commit point (see
    /// `recover`).
    pub fn install_snapshot(
        &mut self,
        snapshot: &serde_json::Value,
        new_conf: &PersistedConfig,
        tail: &[LogEntry],
    ) -> Result<()> {
        let snapshot_path = path_for(&self.base, ".snapshot");
        let snapshot_tmp = path_for(&self.base, ".snapshot.tmp");
        {
            let mut f = File::create(&snapshot_tmp).map_err(|e| Error::io(&snapshot_tmp, e))?;
            let mut line = serde_json::to_string(snapshot)?;
            line.push('\n');
            f.write_all(line.as_bytes())
                .map_err(|e| Error::io(&snapshot_tmp, e))?;
            f.sync_all().map_err(|e| Error::io(&snapshot_tmp, e))?;
        }

        let conf_path = path_for(&self.base, ".conf");
        let conf_tmp = path_for(&self.base, ".conf.tmp");
        {
            let mut f = File::create(&conf_tmp).map_err(|e| Error::io(&conf_tmp, e))?;
            let mut line = serde_json::to_string(new_conf)?;
            line.push('\n');
            f.write_all(line.as_bytes())
                .map_err(|e| Error::io(&conf_tmp, e))?;
            f.sync_all().map_err(|e| Error::io(&conf_tmp, e))?;
        }

        let log_path = path_for(&self.base, ".log");
        let log_tmp = path_for(&self.base, ".log.tmp");
        let mut new_offsets = vec![0u64];
        {
            let mut f = File::create(&log_tmp).map_err(|e| Error::io(&log_tmp, e))?;
            let mut pos = 0u64;
            for entry in tail {
                new_offsets.push(pos);
                let mut line = serde_json::to_string(entry)?;
                line.push('\n');
                pos += line.len() as u64;
                f.write_all(line.as_bytes())
                    .map_err(|e| Error::io(&log_tmp, e))?;
            }
            f.sync_all().map_err(|e| Error::io(&log_tmp, e))?;
        }

        atomic_swap(&snapshot_path, &snapshot_tmp).map_err(|e| Error::io(&snapshot_path, e))?;
        atomic_swap(&conf_path, &conf_tmp).map_err(|e| Error::io(&conf_path, e))?;
        atomic_swap(&log_path, &log_tmp).map_err(|e| Error::io(&log_path, e))?;

        self.log_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)
            .map_err(|e| Error::io(&log_path, e))?;
        self.offsets = new_offsets;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, data: i64) -> LogEntry {
        LogEntry {
            term,
            data: Some(serde_json::json!(data)),
        }
    }

    #[test]
    fn fresh_store_has_sentinel_only() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("node");
        let (_, log, conf) = PersistentStore::open(&base).unwrap();
        assert_eq!(log, vec![LogEntry::sentinel(0)]);
        assert_eq!(conf.commit_index, 0);
    }

    #[test]
    fn append_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("node");
        {
            let (mut store, _, _) = PersistentStore::open(&base).unwrap();
            store.append_entry(&entry(1, 1)).unwrap();
            store.append_entry(&entry(1, 2)).unwrap();
        }
        let (_, log, _) = PersistentStore::open(&base).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1], entry(1, 1));
        assert_eq!(log[2], entry(1, 2));
        assert_eq!(log[0].term, 1);
    }

    #[test]
    fn truncate_suffix_rewinds_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("node");
        {
            let (mut store, _, _) = PersistentStore::open(&base).unwrap();
            store.append_entry(&entry(1, 1)).unwrap();
            store.append_entry(&entry(1, 2)).unwrap();
            store.append_entry(&entry(1, 3)).unwrap();
            store.truncate_suffix(2).unwrap();
            store.append_entry(&entry(2, 9)).unwrap();
        }
        let (_, log, _) = PersistentStore::open(&base).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1], entry(1, 1));
        assert_eq!(log[2], entry(2, 9));
    }

    #[test]
    fn install_snapshot_resets_log_and_conf() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("node");
        let (mut store, _, _) = PersistentStore::open(&base).unwrap();
        store.append_entry(&entry(1, 1)).unwrap();
        store.append_entry(&entry(1, 2)).unwrap();
        store.append_entry(&entry(1, 3)).unwrap();

        let tail = vec![entry(1, 3)];
        let new_conf = PersistedConfig {
            commit_index: 0,
            snapshot_version: 2,
            last_applied: 0,
        };
        store
            .install_snapshot(&serde_json::json!({"x": 1}), &new_conf, &tail)
            .unwrap();

        drop(store);
        let (store2, log, conf) = PersistentStore::open(&base).unwrap();
        assert_eq!(conf.snapshot_version, 2);
        assert_eq!(conf.commit_index, 0);
        assert_eq!(log.len(), 2);
        assert_eq!(log[1], entry(1, 3));
        assert_eq!(store2.read_snapshot().unwrap(), Some(serde_json::json!({"x": 1})));
    }

    #[test]
    fn orphan_tmp_files_discarded_without_log_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("node");
        {
            let (_store, _, _) = PersistentStore::open(&base).unwrap();
        }
        std::fs::write(path_for(&base, ".conf.tmp"), "{}\n").unwrap();
        std::fs::write(path_for(&base, ".snapshot.tmp"), "{}\n").unwrap();

        let (_, _, conf) = PersistentStore::open(&base).unwrap();
        assert_eq!(conf.commit_index, 0);
        assert!(!path_for(&base, ".conf.tmp").exists());
        assert!(!path_for(&base, ".snapshot.tmp").exists());
    }

    #[test]
    fn log_tmp_presence_promotes_all_three() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("node");
        {
            let (_store, _, _) = PersistentStore::open(&base).unwrap();
        }
        std::fs::write(path_for(&base, ".conf.tmp"), "{\"commit_index\":0,\"snapshot_version\":7,\"last_applied\":0}\n").unwrap();
        std::fs::write(path_for(&base, ".snapshot.tmp"), "{\"x\":1}\n").unwrap();
        std::fs::write(path_for(&base, ".log.tmp"), "").unwrap();

        let (_, _, conf) = PersistentStore::open(&base).unwrap();
        assert_eq!(conf.snapshot_version, 7);
    }
}

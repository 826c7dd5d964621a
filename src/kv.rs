//! Key-Value Persistence
//!
//! One file per container, named by its numeric id, on a dedicated tmpfs.
//! A file is a sequence of length-delimited records, each holding a set of
//! string pairs. Writes append a fresh record; reads merge records
//! left-to-right with last-write-wins, so repeated property updates never
//! rewrite the whole file. The store survives a daemon crash but not a
//! reboot, which matches the kernel-held cgroup state it describes.
//!
//! ## On-Disk Framing
//!
//! ```text
//! file    := record*
//! record  := u32 body_len | body
//! body    := u32 pair_count | pair*
//! pair    := u32 key_len | key bytes | u32 val_len | val bytes
//! ```
//!
//! All integers little-endian. A record is written with a single
//! `O_APPEND` write so concurrent appends cannot interleave.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::{info, warn};
use nix::mount::{mount, umount, MsFlags};

use crate::error::{Error, ErrorKind};

/// A set of key/value pairs; order is append order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    pairs: Vec<(String, String)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Fold `next` into `self`: existing keys are overwritten in place,
    /// new keys appended.
    fn merge(&mut self, next: Record) {
        for (key, value) in next.pairs {
            match self.pairs.iter_mut().find(|(k, _)| *k == key) {
                Some(pair) => pair.1 = value,
                None => self.pairs.push((key, value)),
            }
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(self.pairs.len() as u32).to_le_bytes());
        for (key, value) in &self.pairs {
            body.extend_from_slice(&(key.len() as u32).to_le_bytes());
            body.extend_from_slice(key.as_bytes());
            body.extend_from_slice(&(value.len() as u32).to_le_bytes());
            body.extend_from_slice(value.as_bytes());
        }

        let mut framed = Vec::with_capacity(body.len() + 4);
        framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
        framed.extend_from_slice(&body);
        framed
    }

    fn decode(body: &[u8]) -> Result<Record, Error> {
        fn take<'a>(body: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8], Error> {
            let end = cursor
                .checked_add(len)
                .filter(|&end| end <= body.len())
                .ok_or_else(|| Error::new(ErrorKind::Unknown, "truncated kv record"))?;
            let slice = &body[*cursor..end];
            *cursor = end;
            Ok(slice)
        }

        fn take_u32(body: &[u8], cursor: &mut usize) -> Result<u32, Error> {
            let raw = take(body, cursor, 4)?;
            Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        }

        fn take_string(body: &[u8], cursor: &mut usize) -> Result<String, Error> {
            let len = take_u32(body, cursor)? as usize;
            let raw = take(body, cursor, len)?;
            String::from_utf8(raw.to_vec())
                .map_err(|_| Error::new(ErrorKind::Unknown, "non-utf8 kv record"))
        }

        let mut cursor = 0usize;
        let count = take_u32(body, &mut cursor)?;
        let mut record = Record::new();
        for _ in 0..count {
            let key = take_string(body, &mut cursor)?;
            let value = take_string(body, &mut cursor)?;
            record.push(key, value);
        }

        Ok(record)
    }
}

/// Tmpfs-backed store, one node per container id.
#[derive(Debug)]
pub struct KvStore {
    root: PathBuf,
    tmpfs_size: String,
}

impl KvStore {
    pub fn new(root: impl Into<PathBuf>, tmpfs_size: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            tmpfs_size: tmpfs_size.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mount the backing tmpfs unless something is already mounted there.
    pub fn mount_tmpfs(&self) -> Result<(), Error> {
        fs::create_dir_all(&self.root)?;

        if self.is_mounted()? {
            info!("kv tmpfs already mounted at {}", self.root.display());
            return Ok(());
        }

        mount(
            Some("tmpfs"),
            &self.root,
            Some("tmpfs"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(self.tmpfs_size.as_str()),
        )?;
        info!("mounted kv tmpfs at {}", self.root.display());
        Ok(())
    }

    /// Unmount the backing tmpfs, discarding all records.
    pub fn umount_tmpfs(&self) -> Result<(), Error> {
        umount(&self.root)?;
        Ok(())
    }

    fn is_mounted(&self) -> Result<bool, Error> {
        let mounts = fs::read_to_string("/proc/self/mounts")?;
        let target = self.root.to_string_lossy();
        Ok(mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|mp| mp == target))
    }

    fn node_path(&self, id: u16) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Create an empty node; overwrites nothing if the node exists.
    pub fn create(&self, id: u16) -> Result<(), Error> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(self.node_path(id))?;
        Ok(())
    }

    /// Truncate the node and write one fresh record.
    pub fn save(&self, id: u16, record: &Record) -> Result<(), Error> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(self.node_path(id))?;
        file.write_all(&record.encode())?;
        file.sync_data()?;
        Ok(())
    }

    /// Append a single-pair record. One write, O_APPEND, then fsync:
    /// the exit-ack protocol depends on appended state being durable
    /// before the ack leaves the slave.
    pub fn append(&self, id: u16, key: &str, value: &str) -> Result<(), Error> {
        let mut record = Record::new();
        record.push(key, value);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(self.node_path(id))?;
        file.write_all(&record.encode())?;
        file.sync_data()?;
        Ok(())
    }

    /// Load the node, merging records left-to-right.
    pub fn load(&self, id: u16) -> Result<Record, Error> {
        let mut raw = Vec::new();
        File::open(self.node_path(id))?.read_to_end(&mut raw)?;

        let mut merged = Record::new();
        let mut cursor = 0usize;

        while cursor < raw.len() {
            if cursor + 4 > raw.len() {
                warn!("kv node {}: trailing garbage ignored", id);
                break;
            }
            let len = u32::from_le_bytes([
                raw[cursor],
                raw[cursor + 1],
                raw[cursor + 2],
                raw[cursor + 3],
            ]) as usize;
            cursor += 4;

            if cursor + len > raw.len() {
                // A torn final append: everything before it is intact.
                warn!("kv node {}: truncated trailing record ignored", id);
                break;
            }

            merged.merge(Record::decode(&raw[cursor..cursor + len])?);
            cursor += len;
        }

        Ok(merged)
    }

    /// All ids that have a node.
    pub fn list(&self) -> Result<Vec<u16>, Error> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<u16>() {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Remove a node; missing nodes are not an error.
    pub fn remove(&self, id: u16) -> Result<(), Error> {
        match fs::remove_file(self.node_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, KvStore) {
        let dir = TempDir::new().unwrap();
        let store = KvStore::new(dir.path(), "size=1m");
        (dir, store)
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_dir, store) = store();

        let mut record = Record::new();
        record.push("command", "sleep 1000");
        record.push("memory_limit", "33554432");

        store.save(7, &record).unwrap();
        assert_eq!(store.load(7).unwrap(), record);
    }

    #[test]
    fn test_append_merges_last_write_wins() {
        let (_dir, store) = store();

        store.create(3).unwrap();
        store.append(3, "state", "stopped").unwrap();
        store.append(3, "command", "true").unwrap();
        store.append(3, "state", "running").unwrap();

        let merged = store.load(3).unwrap();
        assert_eq!(merged.get("state"), Some("running"));
        assert_eq!(merged.get("command"), Some("true"));
        assert_eq!(merged.pairs().len(), 2);
    }

    #[test]
    fn test_save_resets_history() {
        let (_dir, store) = store();

        store.append(4, "a", "1").unwrap();
        store.append(4, "b", "2").unwrap();

        let mut fresh = Record::new();
        fresh.push("a", "9");
        store.save(4, &fresh).unwrap();

        let merged = store.load(4).unwrap();
        assert_eq!(merged.get("a"), Some("9"));
        assert_eq!(merged.get("b"), None);
    }

    #[test]
    fn test_list_and_remove() {
        let (_dir, store) = store();

        store.create(1).unwrap();
        store.create(10).unwrap();
        store.create(2).unwrap();
        assert_eq!(store.list().unwrap(), vec![1, 2, 10]);

        store.remove(2).unwrap();
        store.remove(2).unwrap();
        assert_eq!(store.list().unwrap(), vec![1, 10]);
    }

    #[test]
    fn test_truncated_tail_is_ignored() {
        let (dir, store) = store();

        store.append(5, "key", "value").unwrap();

        // Simulate a torn append: half a frame at the end of the file.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("5"))
            .unwrap();
        file.write_all(&[0xff, 0x00, 0x00, 0x00, 0x01]).unwrap();

        let merged = store.load(5).unwrap();
        assert_eq!(merged.get("key"), Some("value"));
    }

    #[test]
    fn test_empty_record_value() {
        let (_dir, store) = store();
        store.append(6, "command", "").unwrap();
        assert_eq!(store.load(6).unwrap().get("command"), Some(""));
    }
}

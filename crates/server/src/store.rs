// Durable snapshot store: one file per document.
//
// Layout: `<data_dir>/snapshots/{doc_id}.snap`, a fixed header followed by
// the opaque CRDT state blob. Writes go to a temp file, are fsynced, and
// atomically renamed over the target.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use uuid::Uuid;

const SNAPSHOT_FILE_EXT: &str = "snap";
const SNAPSHOT_MAGIC: [u8; 4] = *b"CSN1";
const SNAPSHOT_FORMAT_VERSION: u8 = 1;
const SNAPSHOT_HEADER_BYTES: usize = 17;

/// A persisted snapshot: the logical version counter plus the opaque blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub version: i64,
    pub payload: Vec<u8>,
}

/// Stores full-document snapshots at `<data_dir>/snapshots/{doc_id}.snap`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    snapshots_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let snapshots_dir = data_dir.as_ref().join("snapshots");
        fs::create_dir_all(&snapshots_dir).with_context(|| {
            format!("failed to create snapshots directory `{}`", snapshots_dir.display())
        })?;
        Ok(Self { snapshots_dir })
    }

    pub fn save(&self, doc_id: Uuid, version: i64, payload: &[u8]) -> Result<PathBuf> {
        let mut header = [0u8; SNAPSHOT_HEADER_BYTES];
        header[..4].copy_from_slice(&SNAPSHOT_MAGIC);
        header[4] = SNAPSHOT_FORMAT_VERSION;
        header[5..13].copy_from_slice(&version.to_le_bytes());
        header[13..17].copy_from_slice(
            &u32::try_from(payload.len())
                .context("snapshot payload exceeds u32::MAX")?
                .to_le_bytes(),
        );

        let target_path = self.snapshot_path(doc_id);
        let tmp_path = self.temp_path_for(doc_id);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("failed to open temp snapshot `{}`", tmp_path.display()))?;

        file.write_all(&header).context("failed to write snapshot header")?;
        file.write_all(payload).context("failed to write snapshot payload")?;
        file.sync_data().context("failed to fsync snapshot file")?;
        drop(file);

        fs::rename(&tmp_path, &target_path).with_context(|| {
            format!(
                "failed to atomically move snapshot `{}` to `{}`",
                tmp_path.display(),
                target_path.display()
            )
        })?;

        Ok(target_path)
    }

    pub fn load(&self, doc_id: Uuid) -> Result<Option<SnapshotRecord>> {
        let path = self.snapshot_path(doc_id);
        if !path.exists() {
            return Ok(None);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .open(&path)
            .with_context(|| format!("failed to open snapshot `{}`", path.display()))?;

        let mut header = [0u8; SNAPSHOT_HEADER_BYTES];
        file.read_exact(&mut header)
            .with_context(|| format!("snapshot `{}` has truncated header", path.display()))?;

        if header[..4] != SNAPSHOT_MAGIC {
            bail!("snapshot `{}` has invalid magic", path.display());
        }

        if header[4] != SNAPSHOT_FORMAT_VERSION {
            bail!("snapshot `{}` has unsupported format version {}", path.display(), header[4]);
        }

        let version = i64::from_le_bytes(header[5..13].try_into().expect("version header slice"));
        let expected_len =
            u32::from_le_bytes(header[13..17].try_into().expect("length header slice")) as usize;

        let mut payload = Vec::new();
        file.read_to_end(&mut payload).context("failed to read snapshot payload")?;
        if payload.len() != expected_len {
            bail!(
                "snapshot `{}` payload length {} does not match header {}",
                path.display(),
                payload.len(),
                expected_len
            );
        }

        Ok(Some(SnapshotRecord { version, payload }))
    }

    pub fn snapshot_path(&self, doc_id: Uuid) -> PathBuf {
        self.snapshots_dir.join(format!("{}.{}", doc_id, SNAPSHOT_FILE_EXT))
    }

    fn temp_path_for(&self, doc_id: Uuid) -> PathBuf {
        self.snapshots_dir.join(format!("{}.{}.tmp", doc_id, SNAPSHOT_FILE_EXT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (SnapshotStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("temp dir should create");
        let store = SnapshotStore::new(dir.path()).expect("store should initialize");
        (store, dir)
    }

    #[test]
    fn save_then_load_round_trips() {
        let (store, _dir) = store();
        let doc_id = Uuid::new_v4();

        store.save(doc_id, 3, b"state blob").expect("save should succeed");
        let record = store.load(doc_id).expect("load should succeed").expect("snapshot exists");

        assert_eq!(record.version, 3);
        assert_eq!(record.payload, b"state blob");
    }

    #[test]
    fn load_missing_returns_none() {
        let (store, _dir) = store();
        assert!(store.load(Uuid::new_v4()).expect("load should succeed").is_none());
    }

    #[test]
    fn save_overwrites_previous_snapshot() {
        let (store, _dir) = store();
        let doc_id = Uuid::new_v4();

        store.save(doc_id, 1, b"first").unwrap();
        store.save(doc_id, 2, b"second").unwrap();

        let record = store.load(doc_id).unwrap().unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.payload, b"second");
    }

    #[test]
    fn invalid_magic_is_rejected() {
        let (store, _dir) = store();
        let doc_id = Uuid::new_v4();
        std::fs::write(store.snapshot_path(doc_id), b"XXXXjunkjunkjunkjunk").unwrap();

        assert!(store.load(doc_id).is_err());
    }

    #[test]
    fn truncated_header_is_rejected() {
        let (store, _dir) = store();
        let doc_id = Uuid::new_v4();
        std::fs::write(store.snapshot_path(doc_id), b"CS").unwrap();

        assert!(store.load(doc_id).is_err());
    }

    #[test]
    fn payload_length_mismatch_is_rejected() {
        let (store, _dir) = store();
        let doc_id = Uuid::new_v4();
        store.save(doc_id, 1, b"payload").unwrap();

        // Append garbage past the recorded length.
        let path = store.snapshot_path(doc_id);
        let mut raw = std::fs::read(&path).unwrap();
        raw.extend_from_slice(b"trailing");
        std::fs::write(&path, raw).unwrap();

        assert!(store.load(doc_id).is_err());
    }

    #[test]
    fn save_into_unwritable_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("snapshots");
        std::fs::write(&blocked, b"not a directory").unwrap();

        assert!(SnapshotStore::new(dir.path()).is_err());
    }
}

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use crate::raft::log::Configuration;
use chrono::{DateTime, Utc};
use raftline_common::{LogIndex, RaftError, RaftResult, Term};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const CURRENT_DIR: &str = "current";
const RECEIVING_DIR: &str = "receiving";
const DATA_DIR: &str = "data";
const METADATA_FILE: &str = "metadata.json";
const STAGING_PREFIX: &str = ".staging-";
const RETIRED_PREFIX: &str = ".retired-";

/// Log position and membership a snapshot supersedes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub configuration: Configuration,
    pub created_at: Option<DateTime<Utc>>,
}

/// One file of the snapshot data directory, named relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub name: String,
    pub len: u64,
}

/// Owns the snapshot directory:
///
/// ```text
/// <root>/current/metadata.json
/// <root>/current/data/...        state machine files
/// <root>/receiving/...           chunks streamed in by a leader
/// <root>/.staging-<uuid>/...     a snapshot being written locally
/// ```
pub struct SnapshotStore {
    root: PathBuf,
    meta: SnapshotMeta,
}

impl SnapshotStore {
    pub fn open(root: impl Into<PathBuf>) -> RaftResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let current = root.join(CURRENT_DIR);
        let mut retired = None;
        for dirent in fs::read_dir(&root)? {
            let path = dirent?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(STAGING_PREFIX) || name == RECEIVING_DIR {
                warn!(path = %path.display(), "removing unfinished snapshot");
                fs::remove_dir_all(&path)?;
            } else if name.starts_with(RETIRED_PREFIX) {
                retired = Some(path);
            }
        }
        // A crash between the two renames of `install` leaves only the retired copy.
        if let Some(retired) = retired {
            if current.exists() {
                fs::remove_dir_all(&retired)?;
            } else {
                fs::rename(&retired, &current)?;
            }
        }

        let meta_path = current.join(METADATA_FILE);
        let meta = if meta_path.exists() {
            serde_json::from_slice(&fs::read(&meta_path)?)?
        } else {
            SnapshotMeta::default()
        };
        info!(
            root = %root.display(),
            last_included_index = meta.last_included_index,
            "opened snapshot store"
        );
        Ok(Self { root, meta })
    }

    pub fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }

    /// Directory holding the state machine files of the current snapshot.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join(CURRENT_DIR).join(DATA_DIR)
    }

    /// A fresh directory to build a snapshot in; its `data` subdirectory goes
    /// to the state machine.
    pub fn staging_dir(&self) -> PathBuf {
        self.root
            .join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4()))
    }

    pub fn staging_data_dir(staging: &Path) -> PathBuf {
        staging.join(DATA_DIR)
    }

    /// Atomically replaces the current snapshot with `staged`.
    pub fn install(&mut self, staged: &Path, meta: SnapshotMeta) -> RaftResult<()> {
        promote(&self.root, staged, &meta)?;
        self.meta = meta;
        Ok(())
    }

    /// Records a snapshot that a [`SnapshotReceiver`] already swapped in.
    pub fn adopt(&mut self, meta: SnapshotMeta) {
        self.meta = meta;
    }

    pub fn receiver(&self) -> SnapshotReceiver {
        SnapshotReceiver {
            root: self.root.clone(),
        }
    }

    /// Lists the data files, sorted by name.
    pub fn files(&self) -> RaftResult<Vec<SnapshotFile>> {
        let data_dir = self.data_dir();
        let mut files = Vec::new();
        if data_dir.exists() {
            collect_files(&data_dir, &data_dir, &mut files)?;
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Reads up to `max` bytes of `name` starting at `offset`.
    pub fn read_chunk(&self, name: &str, offset: u64, max: usize) -> RaftResult<Vec<u8>> {
        let path = self.data_dir().join(checked_name(name)?);
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(max);
        file.take(max as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Writes a snapshot streamed in by a leader. Holds no reference to the
/// store, so its file I/O can be moved onto the blocking pool.
#[derive(Debug, Clone)]
pub struct SnapshotReceiver {
    root: PathBuf,
}

impl SnapshotReceiver {
    fn dir(&self) -> PathBuf {
        self.root.join(RECEIVING_DIR)
    }

    /// Starts receiving a snapshot, discarding a partial one.
    pub fn begin(&self) -> RaftResult<()> {
        let receiving = self.dir();
        if receiving.exists() {
            fs::remove_dir_all(&receiving)?;
        }
        fs::create_dir_all(receiving.join(DATA_DIR))?;
        Ok(())
    }

    pub fn write_chunk(&self, name: &str, offset: u64, data: &[u8]) -> RaftResult<()> {
        let receiving = self.dir();
        if !receiving.exists() {
            return Err(RaftError::Storage(
                "snapshot chunk arrived before the first chunk".into(),
            ));
        }
        let path = receiving.join(DATA_DIR).join(checked_name(name)?);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Swaps the received snapshot in as the current one. The owning store
    /// must then [`adopt`](SnapshotStore::adopt) `meta`.
    pub fn finish(&self, meta: &SnapshotMeta) -> RaftResult<()> {
        let receiving = self.dir();
        if !receiving.exists() {
            return Err(RaftError::Storage("no snapshot is being received".into()));
        }
        promote(&self.root, &receiving, meta)
    }
}

fn promote(root: &Path, staged: &Path, meta: &SnapshotMeta) -> RaftResult<()> {
    fs::create_dir_all(staged.join(DATA_DIR))?;
    let mut file = File::create(staged.join(METADATA_FILE))?;
    file.write_all(&serde_json::to_vec_pretty(meta)?)?;
    file.sync_all()?;

    let current = root.join(CURRENT_DIR);
    let retired = root.join(format!("{}{}", RETIRED_PREFIX, uuid::Uuid::new_v4()));
    if current.exists() {
        fs::rename(&current, &retired)?;
    }
    fs::rename(staged, &current)?;
    if retired.exists() {
        fs::remove_dir_all(&retired)?;
    }

    info!(
        last_included_index = meta.last_included_index,
        last_included_term = meta.last_included_term,
        "installed snapshot"
    );
    Ok(())
}

/// Accepts only plain relative paths inside the snapshot directory.
fn checked_name(name: &str) -> RaftResult<&Path> {
    let path = Path::new(name);
    let plain = !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(path)
    } else {
        Err(RaftError::Storage(format!("invalid snapshot file name {name:?}")))
    }
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<SnapshotFile>) -> RaftResult<()> {
    for dirent in fs::read_dir(dir)? {
        let dirent = dirent?;
        let path = dirent.path();
        if dirent.file_type()?.is_dir() {
            collect_files(base, &path, out)?;
            continue;
        }
        let relative = path
            .strip_prefix(base)
            .map_err(|e| RaftError::Storage(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        out.push(SnapshotFile {
            name,
            len: dirent.metadata()?.len(),
        });
    }
    Ok(())
}

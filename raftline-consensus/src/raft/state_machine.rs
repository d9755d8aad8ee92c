use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

/// Trait for any Raft-compatible application state machine.
///
/// The node calls `apply_data` strictly in log order and never while a
/// snapshot is being written or read on the same instance.
pub trait StateMachine: Send + 'static {
    /// Applies one committed data entry.
    fn apply_data(&mut self, data: &[u8]) -> anyhow::Result<()>;

    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Reads `key` from a named partition of the key space.
    fn get_in(&self, key: &[u8], partition: &[u8]) -> Option<Vec<u8>>;

    /// Materializes the state as of `last_applied_index` into `new_snapshot_dir`.
    ///
    /// `old_snapshot_dir` holds the previous snapshot data (it may not exist).
    fn write_snapshot(
        &mut self,
        old_snapshot_dir: &Path,
        new_snapshot_dir: &Path,
        last_applied_index: u64,
    ) -> anyhow::Result<()>;

    /// Replaces the whole state with the snapshot in `snapshot_dir`.
    fn read_snapshot(&mut self, snapshot_dir: &Path) -> anyhow::Result<()>;
}

//
// Example Implementation: In-Memory Key-Value Store
//

const SNAPSHOT_FILE: &str = "kv.bin";

/// Commands that the key-value store can handle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KvCommand {
    Set {
        partition: Option<String>,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        partition: Option<String>,
        key: Vec<u8>,
    },
}

impl KvCommand {
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        KvCommand::Set {
            partition: None,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// The in-memory key-value store. The unnamed partition is `""`.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: BTreeMap<String, HashMap<Vec<u8>, Vec<u8>>>,
    snapshot_index: u64,
}

impl KeyValueStore {
    pub fn len(&self) -> usize {
        self.data.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the last snapshot this store wrote.
    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    fn partition(name: Option<String>) -> String {
        name.unwrap_or_default()
    }
}

impl StateMachine for KeyValueStore {
    fn apply_data(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let command: KvCommand = bincode::deserialize(data).context("decoding kv command")?;
        match command {
            KvCommand::Set {
                partition,
                key,
                value,
            } => {
                self.data
                    .entry(Self::partition(partition))
                    .or_default()
                    .insert(key, value);
            }
            KvCommand::Delete { partition, key } => {
                if let Some(p) = self.data.get_mut(&Self::partition(partition)) {
                    p.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.get_in(key, b"")
    }

    fn get_in(&self, key: &[u8], partition: &[u8]) -> Option<Vec<u8>> {
        let partition = std::str::from_utf8(partition).ok()?;
        self.data.get(partition)?.get(key).cloned()
    }

    fn write_snapshot(
        &mut self,
        _old_snapshot_dir: &Path,
        new_snapshot_dir: &Path,
        last_applied_index: u64,
    ) -> anyhow::Result<()> {
        fs::create_dir_all(new_snapshot_dir)?;
        let encoded = bincode::serialize(&self.data)?;
        fs::write(new_snapshot_dir.join(SNAPSHOT_FILE), encoded)
            .with_context(|| format!("writing snapshot into {}", new_snapshot_dir.display()))?;
        self.snapshot_index = last_applied_index;
        Ok(())
    }

    fn read_snapshot(&mut self, snapshot_dir: &Path) -> anyhow::Result<()> {
        let path = snapshot_dir.join(SNAPSHOT_FILE);
        self.data = if path.exists() {
            bincode::deserialize(&fs::read(&path)?).context("decoding kv snapshot")?
        } else {
            BTreeMap::new()
        };
        Ok(())
    }
}

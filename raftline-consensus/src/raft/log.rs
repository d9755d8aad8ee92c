use bytes::Bytes;
use raftline_common::{LogIndex, NodeId, RaftError, RaftResult, Server, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const METADATA_FILE: &str = "metadata.json";
const OPEN_PREFIX: &str = "open-";
const RECORD_HEADER_LEN: usize = 4;

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub entry_type: LogEntryType,
    pub data: Bytes,
}

/// How the node interprets an entry's payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntryType {
    Data,          // Opaque application payload for the state machine
    Configuration, // Encoded `Configuration`, applied to membership on commit
}

impl LogEntry {
    pub fn data(term: Term, index: LogIndex, data: impl Into<Bytes>) -> Self {
        Self {
            term,
            index,
            entry_type: LogEntryType::Data,
            data: data.into(),
        }
    }
}

/// Cluster membership. Replicated through the log like any other entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub servers: Vec<Server>,
}

impl Configuration {
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.servers.iter().any(|s| s.server_id == id)
    }

    pub fn server(&self, id: NodeId) -> Option<&Server> {
        self.servers.iter().find(|s| s.server_id == id)
    }

    /// Strict majority of the member count.
    pub fn quorum(&self) -> usize {
        self.servers.len() / 2 + 1
    }

    pub fn encode(&self) -> RaftResult<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(data: &[u8]) -> RaftResult<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Durable node state kept next to the segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub first_log_index: LogIndex,
    pub commit_index: LogIndex,
}

impl Default for LogMetadata {
    fn default() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            first_log_index: 1,
            commit_index: 0,
        }
    }
}

struct Segment {
    first_index: LogIndex,
    path: PathBuf,
    open: bool,
    entries: Vec<LogEntry>,
    offsets: Vec<u64>, // byte offset of each record
    size: u64,
}

impl Segment {
    fn last_index(&self) -> LogIndex {
        self.first_index + self.entries.len() as u64 - 1
    }

    fn closed_name(first: LogIndex, last: LogIndex) -> String {
        format!("{:020}-{:020}", first, last)
    }

    fn open_name(first: LogIndex) -> String {
        format!("{}{:020}", OPEN_PREFIX, first)
    }

    /// Returns (first_index, is_open) for file names produced by this module.
    fn parse_name(name: &str) -> Option<(LogIndex, bool)> {
        if let Some(first) = name.strip_prefix(OPEN_PREFIX) {
            return first.parse().ok().map(|f| (f, true));
        }
        let (first, last) = name.split_once('-')?;
        let first: LogIndex = first.parse().ok()?;
        let _: LogIndex = last.parse().ok()?;
        Some((first, false))
    }
}

/// Append-only log split into segment files, plus the metadata record.
///
/// Entries below `first_log_index` may still sit in a partially compacted
/// segment; they are invisible to readers.
pub struct SegmentedLog {
    dir: PathBuf,
    max_segment_size: u64,
    segments: Vec<Segment>,
    metadata: LogMetadata,
    writer: Option<File>,
}

impl SegmentedLog {
    /// Opens (or creates) the log in `dir`, recovering from a torn tail record.
    pub fn open(dir: impl Into<PathBuf>, max_segment_size: u64) -> RaftResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let metadata = read_metadata(&dir)?.unwrap_or_default();
        let mut log = Self {
            dir,
            max_segment_size,
            segments: Vec::new(),
            metadata,
            writer: None,
        };
        log.load_segments()?;

        info!(
            dir = %log.dir.display(),
            first = log.first_index(),
            last = log.last_index(),
            segments = log.segments.len(),
            "opened log"
        );
        Ok(log)
    }

    fn load_segments(&mut self) -> RaftResult<()> {
        let mut found = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let path = dirent?.path();
            if let Some((first, open)) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(Segment::parse_name)
            {
                found.push((first, open, path));
            }
        }
        found.sort_by_key(|(first, _, _)| *first);

        let count = found.len();
        for (i, (first_index, open, path)) in found.into_iter().enumerate() {
            let is_tail = i + 1 == count;
            if open && !is_tail {
                return Err(RaftError::Storage(format!(
                    "open segment {} is not the last segment",
                    path.display()
                )));
            }
            let segment = load_segment(first_index, open, path, is_tail)?;

            if segment.entries.is_empty() {
                fs::remove_file(&segment.path)?;
                continue;
            }
            if segment.last_index() < self.metadata.first_log_index {
                debug!(path = %segment.path.display(), "removing compacted segment");
                fs::remove_file(&segment.path)?;
                continue;
            }
            let expected_first = match self.segments.last() {
                Some(prev) => prev.last_index() + 1,
                None => segment.first_index.min(self.metadata.first_log_index),
            };
            if segment.first_index != expected_first {
                return Err(RaftError::Storage(format!(
                    "segment {} starts at {} but {} was expected",
                    segment.path.display(),
                    segment.first_index,
                    expected_first
                )));
            }
            self.segments.push(segment);
        }

        if let Some(tail) = self.segments.last().filter(|s| s.open) {
            self.writer = Some(OpenOptions::new().append(true).open(&tail.path)?);
        }
        Ok(())
    }

    pub fn metadata(&self) -> &LogMetadata {
        &self.metadata
    }

    pub fn first_index(&self) -> LogIndex {
        self.metadata.first_log_index
    }

    /// Index of the last entry, or `first_index - 1` when the log is empty.
    pub fn last_index(&self) -> LogIndex {
        self.segments
            .iter()
            .rev()
            .find(|s| !s.entries.is_empty())
            .map(Segment::last_index)
            .unwrap_or(self.metadata.first_log_index - 1)
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index() || index > self.last_index() {
            return None;
        }
        let pos = self
            .segments
            .partition_point(|s| s.first_index <= index)
            .checked_sub(1)?;
        let segment = &self.segments[pos];
        segment.entries.get((index - segment.first_index) as usize)
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.entry(index).map(|e| e.term)
    }

    /// Clones entries in `from..=to`, at most `max` of them.
    pub fn entries(&self, from: LogIndex, to: LogIndex, max: usize) -> Vec<LogEntry> {
        let from = from.max(self.first_index());
        let to = to.min(self.last_index());
        (from..=to)
            .take(max)
            .filter_map(|i| self.entry(i).cloned())
            .collect()
    }

    /// Bytes on disk across all segments.
    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.size).sum()
    }

    /// Appends entries durably. Indices must continue the log without gaps.
    pub fn append(&mut self, entries: &[LogEntry]) -> RaftResult<LogIndex> {
        for entry in entries {
            let expected = self.last_index() + 1;
            if entry.index != expected {
                return Err(RaftError::Storage(format!(
                    "append of index {} but next index is {}",
                    entry.index, expected
                )));
            }

            let payload = bincode::serialize(entry)?;
            let record_len = (RECORD_HEADER_LEN + payload.len()) as u64;
            let needs_roll = match self.segments.last() {
                Some(tail) if tail.open && tail.entries.is_empty() => tail.first_index != entry.index,
                Some(tail) if tail.open => tail.size + record_len > self.max_segment_size,
                _ => true,
            };
            if needs_roll {
                self.roll_segment(entry.index)?;
            }

            let writer = self
                .writer
                .as_mut()
                .ok_or_else(|| RaftError::Storage("no open segment".into()))?;
            writer.write_all(&(payload.len() as u32).to_le_bytes())?;
            writer.write_all(&payload)?;

            let tail = self
                .segments
                .last_mut()
                .ok_or_else(|| RaftError::Storage("no open segment".into()))?;
            tail.offsets.push(tail.size);
            tail.size += record_len;
            tail.entries.push(entry.clone());
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.sync_data()?;
        }
        Ok(self.last_index())
    }

    /// Closes the current open segment (if any) and starts `open-<first>`.
    fn roll_segment(&mut self, first: LogIndex) -> RaftResult<()> {
        if let Some(writer) = self.writer.take() {
            writer.sync_all()?;
        }
        if let Some(tail) = self.segments.last_mut().filter(|s| s.open) {
            if tail.entries.is_empty() {
                fs::remove_file(&tail.path)?;
                self.segments.pop();
            } else {
                let closed = self
                    .dir
                    .join(Segment::closed_name(tail.first_index, tail.last_index()));
                fs::rename(&tail.path, &closed)?;
                tail.path = closed;
                tail.open = false;
            }
        }

        let path = self.dir.join(Segment::open_name(first));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.writer = Some(file);
        self.segments.push(Segment {
            first_index: first,
            path,
            open: true,
            entries: Vec::new(),
            offsets: Vec::new(),
            size: 0,
        });
        debug!(first, "started new log segment");
        Ok(())
    }

    /// Drops every entry after `last_kept`.
    pub fn truncate_suffix(&mut self, last_kept: LogIndex) -> RaftResult<()> {
        if last_kept >= self.last_index() {
            return Ok(());
        }
        if last_kept + 1 < self.first_index() {
            return Err(RaftError::Storage(format!(
                "cannot truncate to {} below first index {}",
                last_kept,
                self.first_index()
            )));
        }
        info!(last_kept, last = self.last_index(), "truncating log suffix");

        while let Some(tail) = self.segments.last() {
            if tail.first_index <= last_kept {
                break;
            }
            if tail.open {
                self.writer = None;
            }
            fs::remove_file(&tail.path)?;
            self.segments.pop();
        }

        if let Some(tail) = self.segments.last_mut() {
            let keep = (last_kept - tail.first_index + 1) as usize;
            if keep < tail.entries.len() {
                let offset = tail.offsets[keep];
                let file = OpenOptions::new().write(true).open(&tail.path)?;
                file.set_len(offset)?;
                file.sync_all()?;
                tail.entries.truncate(keep);
                tail.offsets.truncate(keep);
                tail.size = offset;
            }
            if !tail.open {
                let reopened = self.dir.join(Segment::open_name(tail.first_index));
                fs::rename(&tail.path, &reopened)?;
                tail.path = reopened;
                tail.open = true;
            }
            if self.writer.is_none() {
                self.writer = Some(OpenOptions::new().append(true).open(&tail.path)?);
            }
        }
        Ok(())
    }

    /// Discards entries before `new_first`; whole segments are deleted.
    pub fn truncate_prefix(&mut self, new_first: LogIndex) -> RaftResult<()> {
        if new_first <= self.first_index() {
            return Ok(());
        }
        self.metadata.first_log_index = new_first;
        self.persist_metadata()?;

        while let Some(head) = self.segments.first() {
            if !head.entries.is_empty() && head.last_index() >= new_first {
                break;
            }
            if head.open {
                self.writer = None;
            }
            fs::remove_file(&head.path)?;
            self.segments.remove(0);
        }
        info!(new_first, last = self.last_index(), "truncated log prefix");
        Ok(())
    }

    /// Drops the whole log; the next append must use `new_first`.
    pub fn reset(&mut self, new_first: LogIndex) -> RaftResult<()> {
        self.metadata.first_log_index = new_first;
        self.persist_metadata()?;
        self.writer = None;
        for segment in self.segments.drain(..) {
            fs::remove_file(&segment.path)?;
        }
        warn!(new_first, "discarded entire log");
        Ok(())
    }

    pub fn set_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> RaftResult<()> {
        self.metadata.current_term = term;
        self.metadata.voted_for = voted_for;
        self.persist_metadata()
    }

    pub fn set_commit_index(&mut self, commit_index: LogIndex) -> RaftResult<()> {
        self.metadata.commit_index = commit_index;
        self.persist_metadata()
    }

    fn persist_metadata(&self) -> RaftResult<()> {
        let path = self.dir.join(METADATA_FILE);
        let temp_path = self.dir.join(format!("{METADATA_FILE}.tmp"));

        let json = serde_json::to_vec(&self.metadata)?;
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }
}

fn read_metadata(dir: &Path) -> RaftResult<Option<LogMetadata>> {
    let path = dir.join(METADATA_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Decodes length-prefixed records. A torn record is tolerated only at the
/// end of the tail segment, where it is cut off.
fn load_segment(first_index: LogIndex, open: bool, path: PathBuf, is_tail: bool) -> RaftResult<Segment> {
    let bytes = fs::read(&path)?;
    let mut entries = Vec::new();
    let mut offsets = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let decoded = bytes
            .get(pos..pos + RECORD_HEADER_LEN)
            .and_then(|header| {
                let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
                bytes.get(pos + RECORD_HEADER_LEN..pos + RECORD_HEADER_LEN + len)
            })
            .and_then(|payload| {
                bincode::deserialize::<LogEntry>(payload)
                    .ok()
                    .map(|entry| (entry, payload.len()))
            })
            .filter(|(entry, _)| entry.index == first_index + entries.len() as u64);

        let Some((entry, len)) = decoded else {
            if !is_tail {
                return Err(RaftError::Storage(format!(
                    "corrupt record at offset {} in {}",
                    pos,
                    path.display()
                )));
            }
            warn!(path = %path.display(), offset = pos, "dropping torn tail record");
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(pos as u64)?;
            file.sync_all()?;
            break;
        };

        offsets.push(pos as u64);
        entries.push(entry);
        pos += RECORD_HEADER_LEN + len;
    }

    Ok(Segment {
        first_index,
        path,
        open,
        entries,
        offsets,
        size: pos as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(term: Term, index: LogIndex) -> LogEntry {
        LogEntry::data(term, index, format!("payload-{index}").into_bytes())
    }

    fn segment_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| Segment::parse_name(n).is_some())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_append_and_get_entry() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(dir.path(), 1024 * 1024).unwrap();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 0);

        log.append(&[entry(1, 1), entry(1, 2), entry(2, 3)]).unwrap();

        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.entry(2).unwrap().data, Bytes::from("payload-2"));
        assert!(log.entry(4).is_none());
        assert_eq!(log.entries(2, 10, 10).len(), 2);
        assert_eq!(log.entries(1, 3, 2).len(), 2);
    }

    #[test]
    fn test_rejects_gap() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(dir.path(), 1024).unwrap();
        log.append(&[entry(1, 1)]).unwrap();

        let err = log.append(&[entry(1, 3)]).unwrap_err();
        assert!(matches!(err, RaftError::Storage(_)));
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SegmentedLog::open(dir.path(), 1024 * 1024).unwrap();
            log.append(&[entry(1, 1), entry(1, 2)]).unwrap();
            log.set_term_and_vote(4, Some(2)).unwrap();
            log.set_commit_index(2).unwrap();
        }

        let mut log = SegmentedLog::open(dir.path(), 1024 * 1024).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.metadata().current_term, 4);
        assert_eq!(log.metadata().voted_for, Some(2));
        assert_eq!(log.metadata().commit_index, 2);

        log.append(&[entry(4, 3)]).unwrap();
        assert_eq!(log.term_at(3), Some(4));
    }

    #[test]
    fn test_segments_roll_over() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(dir.path(), 100).unwrap();
        for i in 1..=10 {
            log.append(&[entry(1, i)]).unwrap();
        }

        let files = segment_files(dir.path());
        assert!(files.len() > 1, "expected several segments, got {files:?}");
        assert_eq!(files.iter().filter(|n| n.starts_with(OPEN_PREFIX)).count(), 1);

        let reopened = SegmentedLog::open(dir.path(), 100).unwrap();
        assert_eq!(reopened.last_index(), 10);
        for i in 1..=10 {
            assert_eq!(reopened.entry(i).unwrap().index, i);
        }
    }

    #[test]
    fn test_truncate_suffix_across_segments() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(dir.path(), 100).unwrap();
        for i in 1..=10 {
            log.append(&[entry(1, i)]).unwrap();
        }

        log.truncate_suffix(3).unwrap();
        assert_eq!(log.last_index(), 3);
        log.append(&[entry(2, 4)]).unwrap();
        assert_eq!(log.term_at(4), Some(2));

        let reopened = SegmentedLog::open(dir.path(), 100).unwrap();
        assert_eq!(reopened.last_index(), 4);
        assert_eq!(reopened.term_at(3), Some(1));
        assert_eq!(reopened.term_at(4), Some(2));
    }

    #[test]
    fn test_random_appends_and_truncations_match_model() {
        use rand::Rng;

        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(dir.path(), 200).unwrap();
        let mut model: Vec<LogEntry> = Vec::new();
        let mut rng = rand::rng();
        let mut term = 1;

        for _ in 0..200 {
            if !model.is_empty() && rng.random_bool(0.25) {
                let last_kept = rng.random_range(0..model.len()) as LogIndex;
                log.truncate_suffix(last_kept).unwrap();
                model.truncate(last_kept as usize);
                term += 1;
            } else {
                let count = rng.random_range(1..=4);
                let batch: Vec<LogEntry> = (0..count)
                    .map(|i| entry(term, model.len() as LogIndex + 1 + i))
                    .collect();
                log.append(&batch).unwrap();
                model.extend(batch);
            }
            assert_eq!(log.last_index(), model.len() as LogIndex);
        }

        let reopened = SegmentedLog::open(dir.path(), 200).unwrap();
        assert_eq!(
            reopened.entries(1, reopened.last_index(), usize::MAX),
            model
        );
    }

    #[test]
    fn test_truncate_prefix_deletes_whole_segments() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(dir.path(), 100).unwrap();
        for i in 1..=10 {
            log.append(&[entry(1, i)]).unwrap();
        }
        let before = segment_files(dir.path()).len();

        log.truncate_prefix(6).unwrap();
        assert_eq!(log.first_index(), 6);
        assert!(log.entry(5).is_none());
        assert_eq!(log.entry(6).unwrap().index, 6);
        assert!(segment_files(dir.path()).len() < before);

        let reopened = SegmentedLog::open(dir.path(), 100).unwrap();
        assert_eq!(reopened.first_index(), 6);
        assert_eq!(reopened.last_index(), 10);
    }

    #[test]
    fn test_truncate_prefix_past_end_empties_log() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(dir.path(), 1024).unwrap();
        log.append(&[entry(1, 1), entry(1, 2)]).unwrap();

        log.truncate_prefix(101).unwrap();
        assert_eq!(log.first_index(), 101);
        assert_eq!(log.last_index(), 100);
        log.append(&[entry(3, 101)]).unwrap();
        assert_eq!(log.last_index(), 101);
    }

    #[test]
    fn test_reset_discards_everything() {
        let dir = TempDir::new().unwrap();
        let mut log = SegmentedLog::open(dir.path(), 1024).unwrap();
        log.append(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();

        log.reset(3).unwrap();
        assert_eq!(log.last_index(), 2);
        assert!(log.entry(1).is_none());
        assert!(segment_files(dir.path()).is_empty());

        log.append(&[entry(2, 3)]).unwrap();
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn test_torn_tail_record_is_dropped() {
        let dir = TempDir::new().unwrap();
        {
            let mut log = SegmentedLog::open(dir.path(), 1024 * 1024).unwrap();
            log.append(&[entry(1, 1), entry(1, 2)]).unwrap();
        }
        let tail = dir.path().join(Segment::open_name(1));
        let mut file = OpenOptions::new().append(true).open(&tail).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        let mut log = SegmentedLog::open(dir.path(), 1024 * 1024).unwrap();
        assert_eq!(log.last_index(), 2);
        log.append(&[entry(1, 3)]).unwrap();

        let reopened = SegmentedLog::open(dir.path(), 1024 * 1024).unwrap();
        assert_eq!(reopened.last_index(), 3);
    }

    #[test]
    fn test_configuration_quorum_and_encoding() {
        let config = Configuration::new(vec![
            Server::new(1, "127.0.0.1", 8051),
            Server::new(2, "127.0.0.1", 8052),
            Server::new(3, "127.0.0.1", 8053),
            Server::new(4, "127.0.0.1", 8054),
        ]);
        assert_eq!(config.quorum(), 3);
        assert!(config.contains(4));
        assert!(!config.contains(5));

        let decoded = Configuration::decode(&config.encode().unwrap()).unwrap();
        assert_eq!(decoded, config);
    }
}

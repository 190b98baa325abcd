//! Snapshot-plus-journal file store for mementos.
//!
//! Layout of a store directory:
//!
//! - `mementos.snapshot`: one checkpoint document, replaced atomically.
//! - `mementos.journal`: delta documents appended since that snapshot, each
//!   framed as the encoded bytes between two copies of their little-endian
//!   `u32` length.
//! - `mementos.journal.<ms>.tail`: a torn final frame found on open, kept
//!   for inspection.
//!
//! Loading folds the snapshot and then every journal frame in write order.
//! A journal whose damage is not a torn final frame fails the load.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{Level, event};

use crate::core::{MementoError, Result};
use crate::memento::{GraphMemento, MementoDelta};
use crate::serializer::wire::{self, WireGraph};
use crate::serializer::{LookupContext, MementoSerializer, SerializerConfig};
use crate::storage::MementoPersister;

const SNAPSHOT_FILE: &str = "mementos.snapshot";
const JOURNAL_FILE: &str = "mementos.journal";

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurabilityMode {
    /// fsync every journal append and every snapshot.
    Sync,
    /// Flush journal appends to the OS; fsync snapshots only.
    #[default]
    Async,
    /// Never fsync.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilePersisterOptions {
    pub durability: DurabilityMode,
    /// Journal frames after which the store folds itself into a new
    /// snapshot. Zero disables automatic compaction.
    pub compact_after_deltas: usize,
    pub serializer: SerializerConfig,
}

impl Default for FilePersisterOptions {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::default(),
            compact_after_deltas: 64,
            serializer: SerializerConfig::default(),
        }
    }
}

impl FilePersisterOptions {
    pub fn with_durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_compact_after_deltas(mut self, frames: usize) -> Self {
        self.compact_after_deltas = frames;
        self
    }

    pub fn with_serializer(mut self, serializer: SerializerConfig) -> Self {
        self.serializer = serializer;
        self
    }
}

// ============================================================================
// Journal
// ============================================================================

/// Bytes a frame adds around its payload: the length before and after.
const FRAME_OVERHEAD: usize = 8;

/// How the readable part of a journal ends.
#[derive(Debug, Clone, PartialEq, Eq)]
enum JournalTail {
    Clean,
    /// A partial frame left by a crash mid-append.
    Torn,
    /// Bytes no append could have produced; nothing after them is trusted.
    Corrupt(String),
}

struct JournalScan {
    frames: Vec<Vec<u8>>,
    valid_len: usize,
    tail: JournalTail,
}

fn read_u32(bytes: &[u8]) -> usize {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
}

/// Splits journal bytes into frames. A length that runs past the end of the
/// file is a torn append only if no whole frame follows it.
fn parse_frames(bytes: &[u8]) -> JournalScan {
    let mut frames = Vec::new();
    let mut pos = 0usize;
    let tail = loop {
        let rest = &bytes[pos..];
        if rest.is_empty() {
            break JournalTail::Clean;
        }
        if rest.len() < 4 {
            break JournalTail::Torn;
        }
        let len = read_u32(rest);
        let frame_end = match len.checked_add(FRAME_OVERHEAD) {
            Some(end) if end <= rest.len() => end,
            _ if ends_with_complete_frame(rest) => {
                break JournalTail::Corrupt(format!(
                    "frame at offset {} claims {} bytes but whole frames follow it",
                    pos, len
                ));
            }
            _ => break JournalTail::Torn,
        };
        let trailer = read_u32(&rest[4 + len..]);
        if trailer != len {
            break JournalTail::Corrupt(format!(
                "frame at offset {} has length {} but trailer {}",
                pos, len, trailer
            ));
        }
        frames.push(rest[4..4 + len].to_vec());
        pos += frame_end;
    };
    JournalScan {
        frames,
        valid_len: pos,
        tail,
    }
}

/// True when `region`, which starts at an unreadable frame, still ends with
/// a whole frame. A crash mid-append leaves at most one partial frame.
fn ends_with_complete_frame(region: &[u8]) -> bool {
    if region.len() < 4 + FRAME_OVERHEAD {
        return false;
    }
    let trailer = read_u32(&region[region.len() - 4..]);
    let Some(start) = trailer
        .checked_add(FRAME_OVERHEAD)
        .and_then(|frame| region.len().checked_sub(frame))
    else {
        return false;
    };
    start >= 4 && read_u32(&region[start..]) == trailer
}

fn write_frame(writer: &mut BufWriter<File>, frame: &[u8]) -> std::io::Result<()> {
    let len = (frame.len() as u32).to_le_bytes();
    writer.write_all(&len)?;
    writer.write_all(frame)?;
    writer.write_all(&len)?;
    writer.flush()
}

struct Journal {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    durability: DurabilityMode,
    frames: usize,
    damage: Option<String>,
    set_aside: Option<PathBuf>,
}

impl Journal {
    fn open(path: PathBuf, durability: DurabilityMode) -> Result<Self> {
        let mut journal = Self {
            path,
            file: None,
            durability,
            frames: 0,
            damage: None,
            set_aside: None,
        };
        let bytes = journal.read_bytes()?;
        let scan = parse_frames(&bytes);
        journal.frames = scan.frames.len();

        match scan.tail {
            JournalTail::Clean => {}
            JournalTail::Torn => {
                journal.set_aside_tail(&bytes[scan.valid_len..], scan.valid_len as u64)?;
            }
            JournalTail::Corrupt(reason) => {
                // Left as found: appends are refused and loads fail until a
                // checkpoint replaces the store.
                event!(
                    Level::ERROR,
                    path = %journal.path.display(),
                    complete_frames = scan.frames.len(),
                    reason = %reason,
                    "memento journal is corrupt"
                );
                journal.damage = Some(reason);
                return Ok(journal);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal.path)
            .map_err(|e| MementoError::Io(format!("open journal {}: {}", journal.path.display(), e)))?;
        journal.file = Some(BufWriter::new(file));
        Ok(journal)
    }

    /// Moves a torn tail into a side file, then cuts it from the journal so
    /// later appends start on a frame boundary.
    fn set_aside_tail(&mut self, tail: &[u8], valid_len: u64) -> Result<()> {
        let side = self.path.with_file_name(format!(
            "{}.{}.tail",
            JOURNAL_FILE,
            chrono::Utc::now().timestamp_millis()
        ));
        fs::write(&side, tail)
            .map_err(|e| MementoError::Io(format!("set aside torn journal tail: {}", e)))?;
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| MementoError::Io(format!("open journal: {}", e)))?;
        file.set_len(valid_len)
            .map_err(|e| MementoError::Io(format!("truncate torn journal tail: {}", e)))?;
        event!(
            Level::WARN,
            path = %self.path.display(),
            tail_bytes = tail.len(),
            set_aside = %side.display(),
            "journal ended with a torn frame, moved it aside"
        );
        self.set_aside = Some(side);
        Ok(())
    }

    fn append(&mut self, frame: &[u8]) -> Result<()> {
        self.append_with(frame, write_frame)
    }

    /// Appends one frame through `write`. On failure the file is cut back to
    /// its length before the call, so a partial frame never stays behind.
    fn append_with(
        &mut self,
        frame: &[u8],
        write: impl FnOnce(&mut BufWriter<File>, &[u8]) -> std::io::Result<()>,
    ) -> Result<()> {
        if let Some(reason) = &self.damage {
            return Err(MementoError::Storage(format!(
                "journal is corrupt, refusing to append: {}",
                reason
            )));
        }
        if u32::try_from(frame.len()).is_err() {
            return Err(MementoError::Storage(format!(
                "journal frame of {} bytes is too large",
                frame.len()
            )));
        }
        let mut writer = self
            .file
            .take()
            .ok_or_else(|| MementoError::InvalidState("journal is closed".to_string()))?;
        let before = writer
            .get_ref()
            .metadata()
            .map_err(|e| MementoError::Io(format!("stat journal: {}", e)))?
            .len();

        let written = write(&mut writer, frame).and_then(|()| {
            if self.durability == DurabilityMode::Sync {
                writer.get_ref().sync_all()
            } else {
                Ok(())
            }
        });
        match written {
            Ok(()) => {
                self.file = Some(writer);
                self.frames += 1;
                Ok(())
            }
            Err(err) => {
                // Dropping the buffered bytes instead of flushing them.
                let (file, _unwritten) = writer.into_parts();
                match file.set_len(before) {
                    Ok(()) => self.file = Some(BufWriter::new(file)),
                    Err(e) => {
                        event!(Level::ERROR, error = %e, "rolling back journal append failed");
                        self.damage = Some(format!("partial frame after offset {}", before));
                    }
                }
                Err(MementoError::Io(format!("write journal: {}", err)))
            }
        }
    }

    fn read_bytes(&self) -> Result<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(MementoError::Io(format!("read journal: {}", e))),
        }
    }

    /// Every complete frame. A torn tail ends the journal; corruption fails.
    fn read_frames(&self) -> Result<Vec<Vec<u8>>> {
        if let Some(reason) = &self.damage {
            return Err(MementoError::Encoding(format!("corrupt journal: {}", reason)));
        }
        let scan = parse_frames(&self.read_bytes()?);
        match scan.tail {
            JournalTail::Corrupt(reason) => {
                Err(MementoError::Encoding(format!("corrupt journal: {}", reason)))
            }
            JournalTail::Clean | JournalTail::Torn => Ok(scan.frames),
        }
    }

    fn clear(&mut self) -> Result<()> {
        self.file = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| MementoError::Io(format!("truncate journal: {}", e)))?;
        if self.durability == DurabilityMode::Sync {
            file.sync_all()
                .map_err(|e| MementoError::Io(format!("sync journal: {}", e)))?;
        }
        drop(file);
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| MementoError::Io(format!("reopen journal: {}", e)))?;
        self.file = Some(BufWriter::new(file));
        self.frames = 0;
        self.damage = None;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .map_err(|e| MementoError::Io(format!("flush journal: {}", e)))?;
            if self.durability != DurabilityMode::None {
                file.get_mut()
                    .sync_all()
                    .map_err(|e| MementoError::Io(format!("sync journal: {}", e)))?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Snapshot
// ============================================================================

struct SnapshotFile {
    path: PathBuf,
    durability: DurabilityMode,
}

impl SnapshotFile {
    /// Writes to a temporary file in the same directory, then renames it over
    /// the snapshot. Readers see the old snapshot or the new one.
    fn save(&self, bytes: &[u8]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| MementoError::Storage("snapshot path has no parent".to_string()))?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| MementoError::Io(format!("create temp snapshot: {}", e)))?;
        temp.write_all(bytes)
            .map_err(|e| MementoError::Io(format!("write snapshot: {}", e)))?;
        temp.flush()
            .map_err(|e| MementoError::Io(format!("flush snapshot: {}", e)))?;
        if self.durability != DurabilityMode::None {
            temp.as_file()
                .sync_all()
                .map_err(|e| MementoError::Io(format!("sync snapshot: {}", e)))?;
        }
        temp.persist(&self.path)
            .map_err(|e| MementoError::Io(format!("rename snapshot: {}", e.error)))?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MementoError::Io(format!("read snapshot: {}", e))),
        }
    }
}

// ============================================================================
// File persister
// ============================================================================

struct FileStore {
    journal: Journal,
    snapshot: SnapshotFile,
}

/// Durable [`MementoPersister`] over one directory.
pub struct FileMementoPersister {
    dir: PathBuf,
    options: FilePersisterOptions,
    serializer: MementoSerializer,
    store: Mutex<FileStore>,
    running: AtomicBool,
}

impl FileMementoPersister {
    /// Opens or creates a store in `dir`.
    pub fn open(dir: impl AsRef<Path>, options: FilePersisterOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| MementoError::Io(format!("create store directory {}: {}", dir.display(), e)))?;

        let journal = Journal::open(dir.join(JOURNAL_FILE), options.durability)?;
        let snapshot = SnapshotFile {
            path: dir.join(SNAPSHOT_FILE),
            durability: options.durability,
        };
        event!(
            Level::DEBUG,
            dir = %dir.display(),
            journal_frames = journal.frames,
            "file persister opened"
        );

        Ok(Self {
            serializer: MementoSerializer::new(options.serializer.clone()),
            dir,
            options,
            store: Mutex::new(FileStore { journal, snapshot }),
            running: AtomicBool::new(true),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &FilePersisterOptions {
        &self.options
    }

    pub fn serializer(&self) -> &MementoSerializer {
        &self.serializer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Delta frames written since the last snapshot.
    pub async fn journal_frames(&self) -> usize {
        self.store.lock().await.journal.frames
    }

    /// Why the journal cannot be read, if it is corrupt. A checkpoint
    /// replaces the journal and clears this.
    pub async fn journal_damage(&self) -> Option<String> {
        self.store.lock().await.journal.damage.clone()
    }

    /// Side file holding a torn final frame found when the store was opened.
    pub async fn set_aside_tail(&self) -> Option<PathBuf> {
        self.store.lock().await.journal.set_aside.clone()
    }

    /// Folds the journal into a new snapshot and empties the journal.
    pub async fn compact(&self) -> Result<()> {
        let mut store = self.store.lock().await;
        self.compact_locked(&mut store)
    }

    /// Ids a load would return, per kind, without resolving references.
    pub async fn stored_ids(&self) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
        let store = self.store.lock().await;
        let folded = self.fold(&store)?;
        Ok((
            folded.entities.into_keys().collect(),
            folded.locations.into_keys().collect(),
            folded.policies.into_keys().collect(),
        ))
    }

    fn fold(&self, store: &FileStore) -> Result<WireGraph> {
        let mut folded = WireGraph::default();
        if let Some(bytes) = store.snapshot.load()? {
            folded.apply(self.serializer.decode_document(&bytes)?);
        }
        for frame in store.journal.read_frames()? {
            folded.apply(self.serializer.decode_document(&frame)?);
        }
        Ok(folded)
    }

    fn compact_locked(&self, store: &mut FileStore) -> Result<()> {
        let folded = self.fold(store)?;
        let objects = folded.len();
        let bytes = self.serializer.encode_document(&folded.into_checkpoint())?;
        store.snapshot.save(&bytes)?;
        let frames = store.journal.frames;
        store.journal.clear()?;
        event!(Level::DEBUG, objects, folded_frames = frames, "memento store compacted");
        Ok(())
    }
}

#[async_trait]
impl MementoPersister for FileMementoPersister {
    async fn delta(&self, delta: MementoDelta) -> Result<()> {
        if !self.is_running() {
            event!(Level::DEBUG, "ignoring delta written after stop");
            return Ok(());
        }

        let document = wire::delta_to_wire(&delta, self.serializer.aliases());
        let bytes = self.serializer.encode_document(&document)?;

        let mut store = self.store.lock().await;
        store.journal.append(&bytes)?;
        let threshold = self.options.compact_after_deltas;
        if threshold > 0 && store.journal.frames >= threshold {
            self.compact_locked(&mut store)?;
        }
        Ok(())
    }

    async fn checkpoint(&self, graph: GraphMemento) -> Result<()> {
        if !self.is_running() {
            event!(Level::DEBUG, "ignoring checkpoint written after stop");
            return Ok(());
        }

        let bytes = self.serializer.encode_checkpoint(&graph)?;
        let mut store = self.store.lock().await;
        store.snapshot.save(&bytes)?;
        store.journal.clear()
    }

    async fn load_all(&self, lookup: &dyn LookupContext) -> Result<GraphMemento> {
        if !self.is_running() {
            return Err(MementoError::InvalidState(
                "file persister has been stopped".to_string(),
            ));
        }
        let folded = {
            let store = self.store.lock().await;
            self.fold(&store)?
        };
        self.serializer.graph_from_wire(folded, lookup)
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.store.lock().await.journal.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memento::{EntityMemento, Memento};
    use crate::serializer::{EncodingFormat, StaticLookup};

    fn entity_delta(id: &str, name: &str) -> MementoDelta {
        let mut delta = MementoDelta::new();
        delta
            .entities
            .push(EntityMemento::builder(id, "App").display_name(name).build());
        delta
    }

    #[tokio::test]
    async fn journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let options = FilePersisterOptions::default().with_durability(DurabilityMode::Sync);
        {
            let store = FileMementoPersister::open(dir.path(), options.clone()).unwrap();
            store.delta(entity_delta("e1", "first")).await.unwrap();
            store.delta(entity_delta("e1", "second")).await.unwrap();
            store.stop().await.unwrap();
        }

        let reopened = FileMementoPersister::open(dir.path(), options).unwrap();
        assert_eq!(reopened.journal_frames().await, 2);
        let graph = reopened.load_all(&StaticLookup::new()).await.unwrap();
        assert_eq!(graph.entities["e1"].display_name(), Some("second"));
    }

    #[tokio::test]
    async fn compaction_keeps_contents_and_empties_journal() {
        let dir = tempfile::tempdir().unwrap();
        let options = FilePersisterOptions::default()
            .with_compact_after_deltas(3)
            .with_serializer(SerializerConfig::default().with_format(EncodingFormat::MessagePack));
        let store = FileMementoPersister::open(dir.path(), options).unwrap();

        store.delta(entity_delta("e1", "a")).await.unwrap();
        store.delta(entity_delta("e2", "b")).await.unwrap();
        assert_eq!(store.journal_frames().await, 2);

        let mut removal = MementoDelta::new();
        removal.removed_entity_ids.insert("e1".to_string());
        store.delta(removal).await.unwrap();
        assert_eq!(store.journal_frames().await, 0);

        let graph = store.load_all(&StaticLookup::new()).await.unwrap();
        assert_eq!(graph.entities.keys().collect::<Vec<_>>(), vec!["e2"]);
    }

    #[tokio::test]
    async fn torn_tail_frame_is_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileMementoPersister::open(dir.path(), FilePersisterOptions::default()).unwrap();
            store.delta(entity_delta("e1", "kept")).await.unwrap();
            store.stop().await.unwrap();
        }
        let journal_path = dir.path().join(JOURNAL_FILE);
        let complete_len = fs::metadata(&journal_path).unwrap().len();

        let mut journal = OpenOptions::new().append(true).open(&journal_path).unwrap();
        journal.write_all(&100u32.to_le_bytes()).unwrap();
        journal.write_all(b"{\"partial").unwrap();
        drop(journal);

        let store = FileMementoPersister::open(dir.path(), FilePersisterOptions::default()).unwrap();
        assert_eq!(fs::metadata(&journal_path).unwrap().len(), complete_len);
        let side = store.set_aside_tail().await.unwrap();
        assert_eq!(fs::read(side).unwrap().len(), 4 + b"{\"partial".len());

        store.delta(entity_delta("e2", "after")).await.unwrap();
        let graph = store.load_all(&StaticLookup::new()).await.unwrap();
        assert_eq!(graph.entities.keys().collect::<Vec<_>>(), vec!["e1", "e2"]);
    }

    #[tokio::test]
    async fn corrupt_length_mid_journal_fails_loads_and_keeps_bytes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileMementoPersister::open(dir.path(), FilePersisterOptions::default()).unwrap();
            for id in ["e1", "e2", "e3"] {
                store.delta(entity_delta(id, id)).await.unwrap();
            }
            store.stop().await.unwrap();
        }
        let journal_path = dir.path().join(JOURNAL_FILE);
        let mut bytes = fs::read(&journal_path).unwrap();
        let first = read_u32(&bytes) + FRAME_OVERHEAD;
        bytes[first..first + 4].copy_from_slice(&0x00FF_FFFFu32.to_le_bytes());
        fs::write(&journal_path, &bytes).unwrap();

        let store = FileMementoPersister::open(dir.path(), FilePersisterOptions::default()).unwrap();
        assert!(store.journal_damage().await.is_some());
        assert!(store.set_aside_tail().await.is_none());
        assert_eq!(fs::read(&journal_path).unwrap(), bytes);

        let err = store.load_all(&StaticLookup::new()).await.unwrap_err();
        assert!(err.is_encoding());
        assert!(store.delta(entity_delta("e4", "e4")).await.is_err());
        assert_eq!(fs::read(&journal_path).unwrap(), bytes);

        // A checkpoint replaces the damaged journal.
        store.checkpoint(GraphMemento::new()).await.unwrap();
        store.delta(entity_delta("e4", "e4")).await.unwrap();
        assert!(store.journal_damage().await.is_none());
    }

    #[tokio::test]
    async fn failed_append_leaves_no_partial_frame() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMementoPersister::open(dir.path(), FilePersisterOptions::default()).unwrap();
        let mut guard = store.store.lock().await;
        let journal = &mut guard.journal;

        journal.append(b"first").unwrap();
        let err = journal
            .append_with(b"second", |writer, frame| {
                writer.write_all(&(frame.len() as u32).to_le_bytes())?;
                writer.write_all(&frame[..3])?;
                writer.flush()?;
                Err(std::io::Error::other("disk full"))
            })
            .unwrap_err();
        assert!(matches!(err, MementoError::Io(_)));
        journal.append(b"third").unwrap();

        assert_eq!(journal.frames, 2);
        assert_eq!(
            journal.read_frames().unwrap(),
            vec![b"first".to_vec(), b"third".to_vec()]
        );
    }

    #[tokio::test]
    async fn corrupt_frame_is_an_encoding_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMementoPersister::open(dir.path(), FilePersisterOptions::default()).unwrap();
        store.store.lock().await.journal.append(b"not a document").unwrap();

        let err = store.load_all(&StaticLookup::new()).await.unwrap_err();
        assert!(err.is_encoding());
    }
}

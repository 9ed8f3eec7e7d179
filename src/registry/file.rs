//! Streamable files: VOD sources and recording sinks
//!
//! Storage is reached only through [`StreamableFileFactory`]; the delivery
//! engine never touches a filesystem itself. [`MemoryFileStore`] keeps tags
//! in memory and backs tests and embedded use.

use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::media::flv::FlvTag;
use crate::messaging::{
    Consumer, EndpointId, MessageComponent, OobControlMessage, OobResult, OobService, OobTarget,
    Pipe, PipeConnectionEvent, PipeMessage, Provider, RtmpEvent,
};

/// Keyframe index of a file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyframeMeta {
    /// Reader positions of the keyframes
    pub positions: Vec<u64>,
    /// Timestamps of the keyframes, same order as `positions`
    pub timestamps: Vec<i64>,
    /// Duration of the file in milliseconds
    pub duration: i64,
}

/// Sequential tag reader with random positioning
pub trait TagReader: Send {
    /// Next tag, `None` at end of file
    fn read_tag(&mut self) -> Result<Option<FlvTag>>;

    fn position(&self) -> u64;

    /// Move to a position; past-the-end positions read as end of file
    fn set_position(&mut self, position: u64);

    /// Build the keyframe index, `None` if the format cannot seek
    fn analyze_keyframes(&mut self) -> Option<KeyframeMeta>;

    fn has_video(&self) -> bool;
}

pub trait TagWriter: Send {
    fn write_tag(&mut self, tag: &FlvTag) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A file that can be played back or recorded into
pub trait StreamableFile: Send + Sync {
    fn reader(&self) -> Result<Box<dyn TagReader>>;

    /// Writer that truncates the file
    fn writer(&self) -> Result<Box<dyn TagWriter>>;

    /// Writer that continues after the last tag
    fn append_writer(&self) -> Result<Box<dyn TagWriter>>;
}

/// Resolves storage paths to files
pub trait StreamableFileFactory: Send + Sync {
    /// Existing file at `path`
    fn open(&self, path: &str) -> Option<Arc<dyn StreamableFile>>;

    /// Existing or new file at `path` for recording
    fn create(&self, path: &str) -> Result<Arc<dyn StreamableFile>>;
}

/// In-memory file storage
#[derive(Default)]
pub struct MemoryFileStore {
    files: DashMap<String, Arc<MemoryFile>>,
    read_only: DashSet<String>,
}

impl MemoryFileStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a file with the given tags, replacing any previous one
    pub fn insert(&self, path: impl Into<String>, tags: Vec<FlvTag>) {
        self.files
            .insert(path.into(), Arc::new(MemoryFile::with_tags(tags)));
    }

    /// Copy of the tags stored at `path`
    pub fn tags(&self, path: &str) -> Option<Vec<FlvTag>> {
        self.files.get(path).map(|f| f.tags.read().clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Refuse recording into `path`
    pub fn protect(&self, path: impl Into<String>) {
        self.read_only.insert(path.into());
    }
}

impl StreamableFileFactory for MemoryFileStore {
    fn open(&self, path: &str) -> Option<Arc<dyn StreamableFile>> {
        self.files
            .get(path)
            .map(|f| Arc::clone(f.value()) as Arc<dyn StreamableFile>)
    }

    fn create(&self, path: &str) -> Result<Arc<dyn StreamableFile>> {
        if self.read_only.contains(path) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is read-only", path),
            )
            .into());
        }
        let file = self
            .files
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(MemoryFile::with_tags(Vec::new())))
            .clone();
        Ok(file as Arc<dyn StreamableFile>)
    }
}

struct MemoryFile {
    tags: Arc<RwLock<Vec<FlvTag>>>,
}

impl MemoryFile {
    fn with_tags(tags: Vec<FlvTag>) -> Self {
        Self {
            tags: Arc::new(RwLock::new(tags)),
        }
    }
}

impl StreamableFile for MemoryFile {
    fn reader(&self) -> Result<Box<dyn TagReader>> {
        Ok(Box::new(MemoryReader {
            tags: Arc::new(self.tags.read().clone()),
            index: 0,
        }))
    }

    fn writer(&self) -> Result<Box<dyn TagWriter>> {
        self.tags.write().clear();
        Ok(Box::new(MemoryWriter {
            tags: Arc::clone(&self.tags),
            offset: 0,
        }))
    }

    fn append_writer(&self) -> Result<Box<dyn TagWriter>> {
        let offset = self
            .tags
            .read()
            .iter()
            .map(|t| t.timestamp)
            .max()
            .unwrap_or(0);
        Ok(Box::new(MemoryWriter {
            tags: Arc::clone(&self.tags),
            offset,
        }))
    }
}

struct MemoryReader {
    tags: Arc<Vec<FlvTag>>,
    index: usize,
}

impl TagReader for MemoryReader {
    fn read_tag(&mut self) -> Result<Option<FlvTag>> {
        let tag = self.tags.get(self.index).cloned();
        if tag.is_some() {
            self.index += 1;
        }
        Ok(tag)
    }

    fn position(&self) -> u64 {
        self.index as u64
    }

    fn set_position(&mut self, position: u64) {
        self.index = usize::try_from(position)
            .unwrap_or(usize::MAX)
            .min(self.tags.len());
    }

    fn analyze_keyframes(&mut self) -> Option<KeyframeMeta> {
        let mut meta = KeyframeMeta::default();
        for (i, tag) in self.tags.iter().enumerate() {
            let ts = i64::from(tag.timestamp);
            meta.duration = meta.duration.max(ts);
            if tag.is_keyframe() {
                meta.positions.push(i as u64);
                meta.timestamps.push(ts);
            }
        }
        Some(meta)
    }

    fn has_video(&self) -> bool {
        self.tags.iter().any(FlvTag::is_video)
    }
}

struct MemoryWriter {
    tags: Arc<RwLock<Vec<FlvTag>>>,
    offset: u32,
}

impl TagWriter for MemoryWriter {
    fn write_tag(&mut self, tag: &FlvTag) -> Result<()> {
        let mut tag = tag.clone();
        tag.timestamp = tag.timestamp.saturating_add(self.offset);
        self.tags.write().push(tag);
        Ok(())
    }
}

struct ReaderState {
    reader: Option<Box<dyn TagReader>>,
    keyframes: Option<KeyframeMeta>,
    start: i64,
}

/// Pull provider reading one VOD file
pub struct FileProvider {
    id: EndpointId,
    path: String,
    file: Arc<dyn StreamableFile>,
    state: Mutex<ReaderState>,
}

impl FileProvider {
    pub fn new(path: impl Into<String>, file: Arc<dyn StreamableFile>) -> Arc<Self> {
        Arc::new(Self {
            id: EndpointId::next(),
            path: path.into(),
            file,
            state: Mutex::new(ReaderState {
                reader: None,
                keyframes: None,
                start: 0,
            }),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn ensure_reader(&self, state: &mut ReaderState) -> Result<()> {
        if state.reader.is_some() {
            return Ok(());
        }
        state.reader = Some(self.file.reader()?);
        if state.start > 0 {
            let start = state.start;
            self.seek_locked(state, start);
        }
        Ok(())
    }

    /// Move to the last keyframe at or before `ts` and return its timestamp
    fn seek_locked(&self, state: &mut ReaderState, ts: i64) -> i64 {
        let Some(reader) = state.reader.as_mut() else {
            return ts;
        };
        if state.keyframes.is_none() {
            state.keyframes = reader.analyze_keyframes();
        }
        let Some(meta) = state.keyframes.as_ref() else {
            return ts;
        };
        if meta.positions.is_empty() {
            // Audio-only: no seek
            return ts;
        }
        if ts >= meta.duration {
            reader.set_position(u64::MAX);
            return meta.duration;
        }
        let frame = meta
            .timestamps
            .iter()
            .rposition(|&t| t <= ts)
            .unwrap_or(0);
        reader.set_position(meta.positions[frame]);
        meta.timestamps[frame]
    }

    /// Seek, opening the file first if needed
    pub fn seek(&self, ts: i64) -> i64 {
        let mut state = self.state.lock();
        if let Err(e) = self.ensure_reader(&mut state) {
            tracing::error!(path = %self.path, error = %e, "Failed to open file for seek");
            return ts;
        }
        self.seek_locked(&mut state, ts)
    }

    pub fn has_video(&self) -> bool {
        self.state
            .lock()
            .reader
            .as_ref()
            .map(|r| r.has_video())
            .unwrap_or(false)
    }

    fn uninit(&self) {
        let mut state = self.state.lock();
        state.reader = None;
    }
}

impl MessageComponent for FileProvider {
    fn endpoint_id(&self) -> EndpointId {
        self.id
    }

    fn on_oob_control_message(&self, _pipe: &Pipe, msg: &mut OobControlMessage) {
        match (msg.target, msg.service) {
            (OobTarget::Passive, OobService::Init { start_ts }) => {
                self.state.lock().start = start_ts;
            }
            (OobTarget::SeekableProvider, OobService::Seek { position }) => {
                msg.result = Some(OobResult::Position(self.seek(position)));
            }
            (OobTarget::StreamTypeAwareProvider, OobService::HasVideo) => {
                msg.result = Some(OobResult::Flag(self.has_video()));
            }
            _ => {}
        }
    }

    fn on_pipe_connection_event(&self, _pipe: &Pipe, event: &PipeConnectionEvent) {
        match event {
            PipeConnectionEvent::ProviderDisconnect(id) if *id == self.id => self.uninit(),
            PipeConnectionEvent::ConsumerDisconnect(_) => self.uninit(),
            _ => {}
        }
    }
}

impl Provider for FileProvider {
    fn pull_message(&self, _pipe: &Pipe) -> Result<Option<RtmpEvent>> {
        let mut state = self.state.lock();
        self.ensure_reader(&mut state)?;
        let Some(reader) = state.reader.as_mut() else {
            return Ok(None);
        };
        Ok(reader.read_tag()?.map(|tag| RtmpEvent::from_flv_tag(&tag)))
    }
}

/// How a recording treats an existing file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    Record,
    Append,
}

struct WriterState {
    writer: Option<Box<dyn TagWriter>>,
    offset: i64,
    last_timestamp: i64,
    start_timestamp: Option<i64>,
}

/// Push consumer writing a recording
///
/// Timestamps are rebased to the first recorded event; a reset message
/// continues the timeline after the last written tag.
pub struct FileConsumer {
    id: EndpointId,
    path: String,
    file: Arc<dyn StreamableFile>,
    mode: RecordMode,
    state: Mutex<WriterState>,
}

impl FileConsumer {
    pub fn new(path: impl Into<String>, file: Arc<dyn StreamableFile>, mode: RecordMode) -> Arc<Self> {
        Arc::new(Self {
            id: EndpointId::next(),
            path: path.into(),
            file,
            mode,
            state: Mutex::new(WriterState {
                writer: None,
                offset: 0,
                last_timestamp: 0,
                start_timestamp: None,
            }),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn mode(&self) -> RecordMode {
        self.mode
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if let Some(mut writer) = state.writer.take() {
            if let Err(e) = writer.close() {
                tracing::warn!(path = %self.path, error = %e, "Failed to close recording");
            }
        }
    }
}

impl MessageComponent for FileConsumer {
    fn endpoint_id(&self) -> EndpointId {
        self.id
    }

    fn on_pipe_connection_event(&self, _pipe: &Pipe, event: &PipeConnectionEvent) {
        match event {
            PipeConnectionEvent::ProviderDisconnect(_) => self.close(),
            PipeConnectionEvent::ConsumerDisconnect(id) if *id == self.id => self.close(),
            _ => {}
        }
    }
}

impl Consumer for FileConsumer {
    fn push_message(&self, _pipe: &Pipe, message: &PipeMessage) -> Result<()> {
        let mut state = self.state.lock();
        let event = match message {
            PipeMessage::Reset => {
                state.start_timestamp = None;
                state.offset += state.last_timestamp;
                return Ok(());
            }
            PipeMessage::Status(_) => return Ok(()),
            PipeMessage::Rtmp(event) => event,
        };

        if state.writer.is_none() {
            let writer = match self.mode {
                RecordMode::Record => self.file.writer()?,
                RecordMode::Append => self.file.append_writer()?,
            };
            state.writer = Some(writer);
        }

        let start = *state.start_timestamp.get_or_insert(event.timestamp);
        let timestamp = event.timestamp - start;
        if timestamp < 0 {
            tracing::warn!(path = %self.path, timestamp = event.timestamp, "Skipping message with negative timestamp");
            return Ok(());
        }
        state.last_timestamp = timestamp;

        let mut rebased = event.clone();
        rebased.timestamp = timestamp + state.offset;
        let Some(tag) = rebased.to_flv_tag() else {
            return Ok(());
        };
        match state.writer.as_mut() {
            Some(writer) => writer.write_tag(&tag),
            None => Ok(()),
        }
    }
}

//! Sink Abstraction
//!
//! The destination the writer task commits packets into. Follows the same
//! writer/store split as the WAL layer: a small object-safe trait with
//! positioned writes, plus concrete backends.
//!
//! ## Implementations
//!
//! - `FileSink`: persistent storage (`std::fs::File` behind an optional `BufWriter`)
//! - `MemorySink`: volatile storage (growable `Vec<u8>`)
//! - `SimulatedSink`: DST wrapper with fault injection (see `simulated_sink.rs`)

use crate::coalesce::config::CoalesceConfig;
use crate::coalesce::error::CoalesceError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Cursor, Error as IoError, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Readable, seekable handle returned by `open_for_read`
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

pub type SinkReader = Box<dyn ReadSeek>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    File,
    Memory,
}

/// Where a stream's bytes end up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkSpec {
    /// File on disk. Created if missing; existing content is kept unless
    /// `truncate` is set so partially downloaded files can be resumed.
    File {
        path: PathBuf,
        #[serde(default)]
        truncate: bool,
    },
    /// In-memory buffer, starts empty
    Memory,
}

impl SinkSpec {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        SinkSpec::File {
            path: path.into(),
            truncate: false,
        }
    }

    pub fn kind(&self) -> SinkKind {
        match self {
            SinkSpec::File { .. } => SinkKind::File,
            SinkSpec::Memory => SinkKind::Memory,
        }
    }

    /// Open the sink described by this spec
    pub fn open(&self, config: &CoalesceConfig) -> Result<Box<dyn Sink>, CoalesceError> {
        match self {
            SinkSpec::File { path, truncate } => Ok(Box::new(FileSink::open(
                path,
                *truncate,
                config.file_buffer_bytes,
            )?)),
            SinkSpec::Memory => Ok(Box::new(MemorySink::new())),
        }
    }
}

/// Positioned byte storage driven by the writer task
pub trait Sink: Send {
    fn kind(&self) -> SinkKind;

    /// Current cursor position
    fn position(&self) -> u64;

    fn is_seekable(&self) -> bool {
        true
    }

    /// Move the cursor to an absolute offset. Returns the new position.
    fn seek(&mut self, pos: u64) -> Result<u64, IoError>;

    /// Write all of `data` at the cursor, advancing it.
    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError>;

    /// Commit `data` at `offset`, seeking only when the cursor is elsewhere.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), IoError> {
        if self.position() != offset {
            self.seek(offset)?;
        }
        self.write_all(data)
    }

    /// Push the sink's own buffering down. `sync` additionally asks for
    /// durable storage where the backend has such a notion.
    fn flush(&mut self, sync: bool) -> Result<(), IoError>;

    /// Size of the stored content in bytes
    fn size(&mut self) -> Result<u64, IoError>;

    /// Truncate or zero-extend the stored content
    fn set_len(&mut self, len: u64) -> Result<(), IoError>;

    /// Independent read handle positioned at the start of the content
    fn reader(&mut self) -> Result<SinkReader, IoError>;

    /// Copy of the content for memory-backed sinks
    fn snapshot(&self) -> Option<Vec<u8>> {
        None
    }
}

// ============================================================================
// MemorySink
// ============================================================================

/// Growable in-memory sink. Writes past the end zero-fill the gap.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    data: Vec<u8>,
    pos: u64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        MemorySink { data, pos: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl Sink for MemorySink {
    fn kind(&self) -> SinkKind {
        SinkKind::Memory
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> Result<u64, IoError> {
        if usize::try_from(pos).is_err() {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                "seek beyond addressable memory",
            ));
        }
        self.pos = pos;
        Ok(pos)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        let start = usize::try_from(self.pos)
            .map_err(|_| IoError::new(ErrorKind::InvalidInput, "offset beyond memory"))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "write overflows memory"))?;
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        self.pos = end as u64;
        Ok(())
    }

    fn flush(&mut self, _sync: bool) -> Result<(), IoError> {
        Ok(())
    }

    fn size(&mut self) -> Result<u64, IoError> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<(), IoError> {
        let len = usize::try_from(len)
            .map_err(|_| IoError::new(ErrorKind::InvalidInput, "length beyond memory"))?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn reader(&mut self) -> Result<SinkReader, IoError> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        Some(self.data.clone())
    }
}

// ============================================================================
// FileSink
// ============================================================================

enum FileHandle {
    Direct(File),
    Buffered(BufWriter<File>),
}

impl FileHandle {
    fn file(&self) -> &File {
        match self {
            FileHandle::Direct(f) => f,
            FileHandle::Buffered(w) => w.get_ref(),
        }
    }

    fn drain(&mut self) -> Result<(), IoError> {
        match self {
            FileHandle::Direct(f) => f.flush(),
            FileHandle::Buffered(w) => w.flush(),
        }
    }
}

/// File-backed sink
pub struct FileSink {
    path: PathBuf,
    handle: FileHandle,
    pos: u64,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("path", &self.path)
            .field("pos", &self.pos)
            .finish()
    }
}

impl FileSink {
    /// Open (creating if missing) the file at `path`. `buffer_bytes == 0`
    /// writes straight through to the file.
    pub fn open(path: &Path, truncate: bool, buffer_bytes: usize) -> Result<Self, CoalesceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)
            .map_err(|e| {
                CoalesceError::ResourceUnavailable(format!(
                    "cannot open {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let handle = if buffer_bytes == 0 {
            FileHandle::Direct(file)
        } else {
            FileHandle::Buffered(BufWriter::with_capacity(buffer_bytes, file))
        };

        Ok(FileSink {
            path: path.to_path_buf(),
            handle,
            pos: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn kind(&self) -> SinkKind {
        SinkKind::File
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> Result<u64, IoError> {
        // BufWriter::seek flushes its buffer before moving
        let new_pos = match &mut self.handle {
            FileHandle::Direct(f) => f.seek(SeekFrom::Start(pos))?,
            FileHandle::Buffered(w) => w.seek(SeekFrom::Start(pos))?,
        };
        self.pos = new_pos;
        Ok(new_pos)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), IoError> {
        match &mut self.handle {
            FileHandle::Direct(f) => f.write_all(data)?,
            FileHandle::Buffered(w) => w.write_all(data)?,
        }
        self.pos = self
            .pos
            .checked_add(data.len() as u64)
            .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "file position overflow"))?;
        Ok(())
    }

    fn flush(&mut self, sync: bool) -> Result<(), IoError> {
        self.handle.drain()?;
        if sync {
            self.handle.file().sync_data()?;
        }
        Ok(())
    }

    fn size(&mut self) -> Result<u64, IoError> {
        self.handle.drain()?;
        Ok(self.handle.file().metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<(), IoError> {
        self.handle.drain()?;
        self.handle.file().set_len(len)
    }

    fn reader(&mut self) -> Result<SinkReader, IoError> {
        self.handle.drain()?;
        Ok(Box::new(File::open(&self.path)?))
    }
}

// ============================================================================
// SinkSlot - the single active sink of a stream
// ============================================================================

/// Holder for the one active sink of a stream.
///
/// The writer task takes the lock only for the duration of one packet write;
/// every other caller drains the buffer first so the two never contend over
/// sink state.
pub struct SinkSlot {
    sink: Mutex<Option<Box<dyn Sink>>>,
}

impl SinkSlot {
    pub fn new(sink: Box<dyn Sink>) -> Self {
        SinkSlot {
            sink: Mutex::new(Some(sink)),
        }
    }

    /// Run `f` against the active sink. Fails with `StreamDisposed` once the
    /// sink has been released.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&mut dyn Sink) -> Result<R, IoError>,
    ) -> Result<R, CoalesceError> {
        let mut guard = self.sink.lock();
        let sink = guard.as_mut().ok_or(CoalesceError::StreamDisposed)?;
        f(sink.as_mut()).map_err(CoalesceError::from)
    }

    pub fn kind(&self) -> Option<SinkKind> {
        self.sink.lock().as_ref().map(|s| s.kind())
    }

    /// Swap in a new sink, returning the previous one
    pub fn replace(&self, sink: Box<dyn Sink>) -> Option<Box<dyn Sink>> {
        self.sink.lock().replace(sink)
    }

    /// Take the sink out; later `with` calls fail
    pub fn release(&self) -> Option<Box<dyn Sink>> {
        self.sink.lock().take()
    }
}

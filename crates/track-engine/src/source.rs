//! Seekable byte sources consumed by the demuxers.
//!
//! The engine never assumes HTTP or file specifics: everything goes through
//! [`SeekableSource`]. Resolution of a [`TrackDescriptor`] into a source is the
//! job of a [`SourceOpener`].

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use symphonia::core::io::MediaSource;
use track_types::TrackDescriptor;

use crate::error::{EngineError, Result};

/// Byte stream with random access by absolute position.
pub trait SeekableSource: Read + Send + Sync {
    /// Move the read cursor to `position` bytes from the start.
    fn seek_to(&mut self, position: u64) -> io::Result<()>;

    /// Current read cursor.
    fn position(&self) -> u64;

    /// Total length, when the source knows it.
    fn content_length(&self) -> Option<u64>;

    /// Whether arbitrary seeks are possible.
    fn can_seek(&self) -> bool {
        true
    }
}

impl<S: SeekableSource + ?Sized> SeekableSource for Box<S> {
    fn seek_to(&mut self, position: u64) -> io::Result<()> {
        (**self).seek_to(position)
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn content_length(&self) -> Option<u64> {
        (**self).content_length()
    }

    fn can_seek(&self) -> bool {
        (**self).can_seek()
    }
}

/// Read until `buf` is full or the source is exhausted. Returns the bytes read.
pub fn read_up_to(source: &mut (impl Read + ?Sized), buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Local file source.
pub struct FileSource {
    file: File,
    path: PathBuf,
    position: u64,
    length: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let length = file.metadata()?.len();
        Ok(Self {
            file,
            path,
            position: 0,
            length,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl SeekableSource for FileSource {
    fn seek_to(&mut self, position: u64) -> io::Result<()> {
        self.position = self.file.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.length)
    }
}

/// Source over an owned byte buffer.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    data: Vec<u8>,
    position: u64,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }
}

impl Read for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = (self.position as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl SeekableSource for MemorySource {
    fn seek_to(&mut self, position: u64) -> io::Result<()> {
        self.position = position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Forward-only stream that remembers its first bytes.
///
/// Probing may rewind anywhere inside the saved head. Forward seeks skip by
/// reading; backward seeks past the head fail with `Unsupported`.
pub struct SavedHeadSource {
    inner: Box<dyn Read + Send + Sync>,
    head: Vec<u8>,
    head_limit: usize,
    position: u64,
    inner_position: u64,
    length: Option<u64>,
}

impl SavedHeadSource {
    pub fn new(inner: Box<dyn Read + Send + Sync>, head_limit: usize, length: Option<u64>) -> Self {
        Self {
            inner,
            head: Vec::with_capacity(head_limit.min(64 * 1024)),
            head_limit,
            position: 0,
            inner_position: 0,
            length,
        }
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        let saved = self.head_limit.saturating_sub(self.head.len()).min(n);
        if saved > 0 && self.inner_position == self.head.len() as u64 {
            self.head.extend_from_slice(&buf[..saved]);
        }
        self.inner_position += n as u64;
        Ok(n)
    }
}

impl Read for SavedHeadSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = if self.position < self.inner_position {
            let start = self.position as usize;
            let n = buf.len().min(self.head.len() - start);
            buf[..n].copy_from_slice(&self.head[start..start + n]);
            n
        } else {
            self.read_inner(buf)?
        };
        self.position += n as u64;
        Ok(n)
    }
}

impl SeekableSource for SavedHeadSource {
    fn seek_to(&mut self, position: u64) -> io::Result<()> {
        if position < self.inner_position && position >= self.head.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot seek backwards past the saved head",
            ));
        }
        if position <= self.inner_position {
            self.position = position;
            return Ok(());
        }
        let mut scratch = [0u8; 4096];
        self.position = self.inner_position;
        while self.inner_position < position {
            let want = ((position - self.inner_position) as usize).min(scratch.len());
            let n = self.read_inner(&mut scratch[..want])?;
            if n == 0 {
                break;
            }
        }
        self.position = self.inner_position;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn content_length(&self) -> Option<u64> {
        self.length
    }

    fn can_seek(&self) -> bool {
        false
    }
}

/// Records a source position and restores it when dropped.
pub struct ProbeCheckpoint<'a> {
    source: &'a mut dyn SeekableSource,
    start: u64,
    restore: bool,
}

impl<'a> ProbeCheckpoint<'a> {
    pub fn new(source: &'a mut dyn SeekableSource) -> Self {
        let start = source.position();
        Self {
            source,
            start,
            restore: true,
        }
    }

    pub fn source(&mut self) -> &mut dyn SeekableSource {
        &mut *self.source
    }

    /// Keep the current position instead of restoring.
    pub fn commit(mut self) {
        self.restore = false;
    }
}

impl Drop for ProbeCheckpoint<'_> {
    fn drop(&mut self) {
        if self.restore {
            if let Err(e) = self.source.seek_to(self.start) {
                tracing::warn!(position = self.start, "probe checkpoint restore failed: {e}");
            }
        }
    }
}

/// Bridges a [`SeekableSource`] to the software container readers.
pub struct MediaSourceAdapter {
    inner: Box<dyn SeekableSource>,
}

impl MediaSourceAdapter {
    pub fn new(inner: Box<dyn SeekableSource>) -> Self {
        Self { inner }
    }
}

impl Read for MediaSourceAdapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for MediaSourceAdapter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(d) => self.inner.position().checked_add_signed(d),
            SeekFrom::End(d) => {
                let len = self.inner.content_length().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Unsupported, "source length unknown")
                })?;
                len.checked_add_signed(d)
            }
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
        self.inner.seek_to(target)?;
        Ok(self.inner.position())
    }
}

impl MediaSource for MediaSourceAdapter {
    fn is_seekable(&self) -> bool {
        self.inner.can_seek()
    }

    fn byte_len(&self) -> Option<u64> {
        self.inner.content_length()
    }
}

/// Resolves a track descriptor to a byte source.
pub trait SourceOpener: Send + Sync {
    fn open(&self, descriptor: &TrackDescriptor) -> Result<Box<dyn SeekableSource>>;
}

impl<F> SourceOpener for F
where
    F: Fn(&TrackDescriptor) -> Result<Box<dyn SeekableSource>> + Send + Sync,
{
    fn open(&self, descriptor: &TrackDescriptor) -> Result<Box<dyn SeekableSource>> {
        self(descriptor)
    }
}

/// Treats the descriptor URI as a local path (`file://` prefix optional).
#[derive(Clone, Copy, Debug, Default)]
pub struct FileOpener;

impl SourceOpener for FileOpener {
    fn open(&self, descriptor: &TrackDescriptor) -> Result<Box<dyn SeekableSource>> {
        let path = descriptor
            .uri
            .strip_prefix("file://")
            .unwrap_or(&descriptor.uri);
        let source = FileSource::open(path).map_err(EngineError::Io)?;
        tracing::debug!(path = %source.path().display(), len = source.length, "opened file source");
        Ok(Box::new(source))
    }
}

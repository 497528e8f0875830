//! Byte sources that images are decoded from.
//!
//! A [`Source`] is shared: the decoder reads through it while stream-backed
//! regions keep references to it so the encoder can re-read their bytes
//! later. Every operation therefore takes `&self`.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Error, Result};

/// Anything that can both read and seek.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

enum Reader {
    Seekable(Box<dyn ReadSeek>),
    Sequential(Box<dyn Read>),
}

struct SourceState {
    reader: Reader,
    offset: u64,
}

/// A readable byte source, either seekable or strictly sequential.
///
/// Sequential sources (pipes, standard input) support forward reading only.
/// Any operation that must reposition them fails with
/// [`ErrorKind::NotSeekable`](crate::ErrorKind::NotSeekable).
pub struct Source {
    state: RefCell<SourceState>,
}

impl Source {
    /// Wraps a reader that supports seeking.
    pub fn seekable<R: Read + Seek + 'static>(reader: R) -> Self {
        Self::from_reader(Reader::Seekable(Box::new(reader)))
    }

    /// Wraps a reader that can only be read forward.
    pub fn sequential<R: Read + 'static>(reader: R) -> Self {
        Self::from_reader(Reader::Sequential(Box::new(reader)))
    }

    /// Opens a file as a seekable source.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        Ok(Self::seekable(file))
    }

    fn from_reader(reader: Reader) -> Self {
        Self {
            state: RefCell::new(SourceState { reader, offset: 0 }),
        }
    }

    /// Whether this source can be repositioned.
    pub fn can_seek(&self) -> bool {
        matches!(self.state.borrow().reader, Reader::Seekable(_))
    }

    /// Current read offset from the start of the source.
    pub fn offset(&self) -> u64 {
        self.state.borrow().offset
    }

    /// Fills `buf` completely or fails with an end-of-input error.
    pub fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let result = match &mut state.reader {
            Reader::Seekable(r) => r.read_exact(buf),
            Reader::Sequential(r) => r.read_exact(buf),
        };

        let e = match result {
            Ok(()) => {
                state.offset += buf.len() as u64;
                return Ok(());
            }
            Err(e) => e,
        };

        let requested_at = state.offset;
        // A failed read may have consumed part of the input.
        if let Reader::Seekable(r) = &mut state.reader {
            if let Ok(pos) = r.stream_position() {
                state.offset = pos;
            }
        }

        if e.kind() == io::ErrorKind::UnexpectedEof {
            Err(Error::unexpected_eof(format!(
                "{} bytes at offset {}",
                buf.len(),
                requested_at
            )))
        } else {
            Err(Error::io_simple(e))
        }
    }

    /// Moves to an absolute offset.
    pub fn seek_to(&self, offset: u64) -> Result<()> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        match &mut state.reader {
            Reader::Seekable(r) => {
                r.seek(SeekFrom::Start(offset))?;
                state.offset = offset;
                Ok(())
            }
            Reader::Sequential(_) => Err(Error::not_seekable(format!(
                "cannot seek to offset {}",
                offset
            ))),
        }
    }

    /// Advances past `len` bytes without returning them.
    ///
    /// Sequential sources consume the bytes by reading them.
    pub fn skip(&self, len: u64) -> Result<()> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let target = state
            .offset
            .checked_add(len)
            .ok_or_else(|| Error::overflow("skip past end of addressable range"))?;

        match &mut state.reader {
            Reader::Seekable(r) => {
                let end = r.seek(SeekFrom::End(0))?;
                if target > end {
                    r.seek(SeekFrom::Start(state.offset))?;
                    return Err(Error::unexpected_eof(format!(
                        "{} skipped bytes at offset {} of {}",
                        len, state.offset, end
                    )));
                }
                r.seek(SeekFrom::Start(target))?;
            }
            Reader::Sequential(r) => {
                let copied = io::copy(&mut r.by_ref().take(len), &mut io::sink())?;
                if copied != len {
                    return Err(Error::unexpected_eof(format!(
                        "{} skipped bytes at offset {}",
                        len, state.offset
                    )));
                }
            }
        }

        state.offset = target;
        Ok(())
    }

    /// Returns to the start of the source.
    pub fn rewind(&self) -> Result<()> {
        self.seek_to(0)
    }

    /// Total length of the source. Leaves the read offset unchanged.
    pub fn len(&self) -> Result<u64> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let offset = state.offset;
        match &mut state.reader {
            Reader::Seekable(r) => {
                let len = r.seek(SeekFrom::End(0))?;
                r.seek(SeekFrom::Start(offset))?;
                Ok(len)
            }
            Reader::Sequential(_) => Err(Error::not_seekable("cannot determine stream length")),
        }
    }

    /// Reads `buf.len()` bytes starting at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek_to(offset)?;
        self.read_exact(buf)
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("seekable", &self.can_seek())
            .field("offset", &self.offset())
            .finish()
    }
}

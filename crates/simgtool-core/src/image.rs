//! Sparse image orchestration.
//!
//! A [`SparseImage`] binds a block size and a logical length to a region
//! list. Decoding fills it (see [`crate::read`]), callers may add or append
//! regions, and the write entry points drive the encoder over it.
//!
//! # Example
//!
//! ```no_run
//! use simgtool_core::{OutputTarget, SparseImage, TracingDiagnostics, WriteOptions};
//! use std::fs::File;
//! use std::path::Path;
//!
//! let image = SparseImage::import_mapped(Path::new("system.img"), true, &TracingDiagnostics);
//! let mut image = image.unwrap();
//! let mut out = File::create("system.raw").unwrap();
//! image
//!     .write(OutputTarget::Seekable(&mut out), WriteOptions::raw(), None)
//!     .unwrap();
//! ```

use std::io;
use std::path::Path;

use crate::error::{Error, Result};
use crate::format::{align_down, CHUNK_HEADER_LEN, SPARSE_HEADER_LEN};
use crate::region::{Backing, RegionList, SharedBuf};
use crate::source::Source;
use crate::write::{
    count_chunks, write_regions, ByteCounter, CallbackWriter, ChunkWriter, OutputTarget,
    WriteOptions, WriteProgress,
};

/// Block size used for flat input and by `img2simg` when none is given.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Largest region emitted as one chunk. Longer regions are split first.
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// An image: block size, logical length and the regions holding its data.
#[derive(Debug)]
pub struct SparseImage<'src> {
    block_size: u32,
    len: u64,
    regions: RegionList<'src>,
}

impl<'src> SparseImage<'src> {
    /// Creates an empty image. `block_size` must be a non-zero multiple of 4.
    pub fn new(block_size: u32, len: u64) -> Result<Self> {
        if block_size == 0 || block_size % 4 != 0 {
            return Err(Error::invalid_argument(format!(
                "block size {} is not a non-zero multiple of 4",
                block_size
            )));
        }

        Ok(Self {
            block_size,
            len,
            regions: RegionList::new(block_size),
        })
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Logical length of the expanded image in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the logical length is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Changes the logical length. Regions past the new end are kept.
    pub fn set_len(&mut self, len: u64) {
        self.len = len;
    }

    /// The image's regions in block order.
    pub fn regions(&self) -> &RegionList<'src> {
        &self.regions
    }

    pub(crate) fn regions_mut(&mut self) -> &mut RegionList<'src> {
        &mut self.regions
    }

    pub(crate) fn into_regions(self) -> RegionList<'src> {
        self.regions
    }

    /// Adds in-memory data at `block`.
    pub fn add_data(&mut self, data: impl Into<SharedBuf>, block: u32) -> Result<()> {
        let buf = data.into();
        let len = buf.len() as u64;
        self.regions.add_data(buf, 0, len, block)
    }

    /// Adds `len` bytes of the repeated word `value` at `block`.
    pub fn add_fill(&mut self, value: u32, len: u64, block: u32) -> Result<()> {
        self.regions.add_fill(value, len, block)
    }

    /// Adds `len` bytes of the file at `path`, starting at `offset`, at `block`.
    pub fn add_file(&mut self, path: impl AsRef<Path>, offset: u64, len: u64, block: u32) -> Result<()> {
        self.regions.add_file(path.as_ref(), offset, len, block)
    }

    /// Adds `len` bytes of `source`, starting at `offset`, at `block`.
    pub fn add_stream(&mut self, source: &'src Source, offset: u64, len: u64, block: u32) -> Result<()> {
        self.regions.add_stream(source, offset, len, block)
    }

    /// First block past the logical end, for appending.
    fn append_block(&self, len: u64) -> Result<u32> {
        let block_size = self.block_size as u64;
        if self.len % block_size != 0 {
            return Err(Error::invalid_argument(format!(
                "image length {} is not a multiple of block size {}",
                self.len, block_size
            )));
        }
        if len % block_size != 0 {
            return Err(Error::invalid_argument(format!(
                "appended length {} is not a multiple of block size {}",
                len, block_size
            )));
        }

        let block = self.len / block_size;
        u32::try_from(block).map_err(|_| Error::overflow(format!("append at block {}", block)))
    }

    /// Appends `len` bytes of `source` at `offset` to the end of the image.
    pub fn append_stream(&mut self, source: &'src Source, offset: u64, len: u64) -> Result<()> {
        let block = self.append_block(len)?;
        if len > 0 {
            self.regions.add_stream(source, offset, len, block)?;
        }
        self.len += len;
        Ok(())
    }

    /// Appends the whole file at `path` to the end of the image.
    pub fn append_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let len = std::fs::metadata(path)
            .map_err(|e| Error::io(e, path))?
            .len();
        let block = self.append_block(len)?;
        if len > 0 {
            self.regions.add_file(path, 0, len, block)?;
        }
        self.len += len;
        tracing::debug!(path = %path.display(), len, block, "appended file");
        Ok(())
    }

    /// Encodes the image to `target`.
    ///
    /// Regions longer than [`MAX_CHUNK_SIZE`] are split first. `progress`,
    /// if given, receives monotonic reports starting at zero.
    pub fn write(
        &mut self,
        target: OutputTarget<'_>,
        options: WriteOptions,
        progress: Option<&mut dyn FnMut(WriteProgress)>,
    ) -> Result<()> {
        self.encode(target, options, progress, false)
    }

    /// Encodes the image, handing every output buffer to `write_fn`.
    pub fn write_with<F>(&mut self, options: WriteOptions, write_fn: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> io::Result<()>,
    {
        let mut sink = CallbackWriter(write_fn);
        self.encode(OutputTarget::Stream(&mut sink), options, None, false)
    }

    /// Number of bytes [`write`](Self::write) would produce, without reading
    /// any file or stream payloads.
    pub fn output_len(&mut self, options: WriteOptions) -> Result<u64> {
        let mut counter = ByteCounter::default();
        self.encode(OutputTarget::Stream(&mut counter), options, None, true)?;
        Ok(counter.0)
    }

    fn encode(
        &mut self,
        target: OutputTarget<'_>,
        options: WriteOptions,
        progress: Option<&mut dyn FnMut(WriteProgress)>,
        dry_run: bool,
    ) -> Result<()> {
        let max_chunk = align_down(MAX_CHUNK_SIZE, self.block_size as u64).max(self.block_size as u64);
        let before = self.regions.len();
        self.regions.split_all(max_chunk)?;
        if self.regions.len() != before {
            tracing::debug!(before, after = self.regions.len(), "split oversized regions");
        }

        let chunks = count_chunks(&self.regions, self.len)?;
        let mut writer = ChunkWriter::open(target, self.block_size, self.len, options, chunks)?;
        if dry_run {
            writer.set_dry_run();
        }
        write_regions(&mut writer, &self.regions, self.len, progress)?;
        writer.finish()
    }

    /// Splits this image into images of the same block size and logical
    /// length, each of which encodes (chunked, with checksum) to at most
    /// `max_len` bytes. Regions are moved out, leaving this image empty.
    pub fn resparse(&mut self, max_len: u64) -> Result<Vec<SparseImage<'src>>> {
        let block_size = self.block_size as u64;
        let chunk_header = CHUNK_HEADER_LEN as u64;
        // File header, a trailing skip chunk and the CRC32 chunk.
        let overhead = SPARSE_HEADER_LEN as u64 + 2 * chunk_header + 4;

        let budget = max_len
            .checked_sub(overhead)
            .filter(|&budget| budget >= chunk_header + block_size)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "maximum size {} leaves no room for a {} byte block",
                    max_len, block_size
                ))
            })?;

        let mut pieces = Vec::new();
        loop {
            let mut piece = SparseImage::new(self.block_size, self.len)?;
            let taken = self.take_up_to(budget)?;
            self.regions.move_range(&mut piece.regions, ..taken)?;
            pieces.push(piece);
            if self.regions.is_empty() {
                break;
            }
        }

        tracing::debug!(pieces = pieces.len(), max_len, "resparsed image");
        Ok(pieces)
    }

    /// Number of leading regions whose chunks fit in `budget` bytes, after
    /// splitting the first one that does not fit if that is worthwhile.
    fn take_up_to(&mut self, budget: u64) -> Result<usize> {
        let block_size = self.block_size;
        let chunk_header = CHUNK_HEADER_LEN as u64;
        let mut used = 0u64;
        let mut last_block = 0u64;

        for index in 0..self.regions.len() {
            let Some(region) = self.regions.get(index) else {
                break;
            };

            let gap = if region.start_block() as u64 > last_block {
                chunk_header
            } else {
                0
            };
            let cost = gap + region.encoded_len(block_size);
            last_block = region.end_block(block_size);

            if used + cost <= budget {
                used += cost;
                continue;
            }

            let room = budget.saturating_sub(used + gap + chunk_header);
            let splittable = !matches!(region.backing(), Backing::Fill(_))
                && align_down(room, block_size as u64) >= block_size as u64;

            if splittable && (index == 0 || room > budget / 8) {
                self.regions.split(index, room)?;
                return Ok(index + 1);
            }
            if index == 0 {
                return Err(Error::invalid_argument(format!(
                    "region at block {} does not fit in {} bytes",
                    region.start_block(),
                    budget
                )));
            }
            return Ok(index);
        }

        Ok(self.regions.len())
    }
}

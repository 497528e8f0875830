//! Sparse and flat image encoder.
//!
//! The encoder walks a region list in block order. Gaps between regions, and
//! the space between the last region and the logical end of the image, are
//! emitted as skips. In chunked mode every region and every skip becomes one
//! chunk; in flat mode the expanded bytes are written directly.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::format::{
    align, alloc_buffer, div_round_up, Checksum, ChunkHeader, ChunkType, SparseHeader,
};
use crate::region::{Backing, Region, RegionList};
use crate::source::Source;

/// Size of the buffer used to copy file- and stream-backed payloads.
pub const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Size of the zero and fill buffers used to materialize skips and fills.
pub const ZERO_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// A seekable output that can also be truncated or extended.
pub trait SeekableOutput: Write + Seek {
    /// Sets the total output length, truncating or zero-extending.
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl SeekableOutput for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

impl SeekableOutput for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "length exceeds address space")
        })?;
        self.get_mut().resize(len, 0);
        Ok(())
    }
}

/// Where encoded output goes.
///
/// Seekable outputs skip by seeking and are padded or truncated to the
/// logical length at the end of a flat write. Push-only outputs receive
/// explicit zero bytes for skips and cannot be padded or truncated.
pub enum OutputTarget<'a> {
    /// A file or buffer supporting seek and set-length.
    Seekable(&'a mut dyn SeekableOutput),
    /// A pipe, socket or callback that only accepts appended bytes.
    Stream(&'a mut dyn Write),
}

impl OutputTarget<'_> {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            OutputTarget::Seekable(w) => w.write_all(bytes)?,
            OutputTarget::Stream(w) => w.write_all(bytes)?,
        }
        Ok(())
    }

    fn write_zeros(&mut self, len: u64, zeros: &[u8]) -> Result<()> {
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            self.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
        Ok(())
    }

    fn skip(&mut self, len: u64, zeros: &[u8]) -> Result<()> {
        match self {
            OutputTarget::Seekable(w) => {
                let delta = i64::try_from(len)
                    .map_err(|_| Error::overflow(format!("skip of {} bytes", len)))?;
                w.seek(SeekFrom::Current(delta))?;
                Ok(())
            }
            OutputTarget::Stream(_) => self.write_zeros(len, zeros),
        }
    }

    fn pad(&mut self, len: u64, position: u64) -> Result<()> {
        match self {
            OutputTarget::Seekable(w) => {
                w.set_len(len)?;
                Ok(())
            }
            OutputTarget::Stream(_) if position == len => Ok(()),
            OutputTarget::Stream(_) => Err(Error::not_supported(format!(
                "cannot resize push-only output from {} to {} bytes",
                position, len
            ))),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            OutputTarget::Seekable(w) => w.flush()?,
            OutputTarget::Stream(w) => w.flush()?,
        }
        Ok(())
    }
}

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Write the chunked sparse format instead of a flat image.
    pub chunked: bool,
    /// Append a CRC32 chunk (chunked mode only).
    pub checksum: bool,
    /// Compress the output. Not implemented.
    pub compressed: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self::sparse()
    }
}

impl WriteOptions {
    /// Chunked sparse output without a checksum.
    pub fn sparse() -> Self {
        Self {
            chunked: true,
            checksum: false,
            compressed: false,
        }
    }

    /// Chunked sparse output with a trailing CRC32 chunk.
    pub fn sparse_with_checksum() -> Self {
        Self {
            checksum: true,
            ..Self::sparse()
        }
    }

    /// Flat, fully expanded output.
    pub fn raw() -> Self {
        Self {
            chunked: false,
            checksum: false,
            compressed: false,
        }
    }
}

/// Progress of an encode, in logical bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteProgress {
    /// Logical bytes emitted so far.
    pub bytes_processed: u64,
    /// Logical length of the image.
    pub bytes_total: u64,
}

impl WriteProgress {
    /// Percentage of the image emitted.
    pub fn percent_complete(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_processed as f64 / self.bytes_total as f64) * 100.0
    }
}

/// Number of chunks [`write_regions`] will emit for this list, excluding the
/// trailing CRC32 chunk.
pub(crate) fn count_chunks(regions: &RegionList<'_>, len: u64) -> Result<u32> {
    let block_size = regions.block_size();
    let mut last_block = 0u64;
    let mut chunks = 0u64;

    for region in regions {
        if region.start_block() as u64 > last_block {
            chunks += 1;
        }
        chunks += 1;
        last_block = region.end_block(block_size);
    }

    if last_block < div_round_up(len, block_size as u64) {
        chunks += 1;
    }

    u32::try_from(chunks).map_err(|_| Error::overflow(format!("{} chunks", chunks)))
}

/// Emits every region of `regions`, with skips for the gaps, padded out to
/// `len` logical bytes.
pub(crate) fn write_regions(
    writer: &mut ChunkWriter<'_>,
    regions: &RegionList<'_>,
    len: u64,
    mut progress: Option<&mut dyn FnMut(WriteProgress)>,
) -> Result<()> {
    let block_size = regions.block_size() as u64;
    let mut last_block = 0u64;
    let mut processed = 0u64;

    let mut report = |processed: u64| {
        if let Some(callback) = progress.as_mut() {
            callback(WriteProgress {
                bytes_processed: processed,
                bytes_total: len,
            });
        }
    };

    report(0);

    for region in regions {
        let start = region.start_block() as u64;
        if start > last_block {
            let skip = (start - last_block) * block_size;
            writer.write_skip(skip)?;
            processed = (processed + skip).min(len);
            report(processed);
        }

        writer.write_region(region)?;

        last_block = region.end_block(block_size as u32);
        processed = processed.max((last_block * block_size).min(len));
        report(processed);
    }

    let covered = last_block * block_size;
    if len > covered {
        writer.write_skip(len - covered)?;
        report(len);
    }

    Ok(())
}

/// Low-level writer for one encode pass.
pub(crate) struct ChunkWriter<'a> {
    target: OutputTarget<'a>,
    chunked: bool,
    checksum: Option<Checksum>,
    block_size: u64,
    len: u64,
    /// Logical bytes covered so far.
    position: u64,
    chunks_declared: u32,
    chunks_written: u32,
    zero_buf: Vec<u8>,
    fill_buf: Vec<u8>,
    /// Emit zeros in place of file and stream payloads instead of reading them.
    dry_run: bool,
}

impl<'a> ChunkWriter<'a> {
    /// Starts an encode. In chunked mode the file header is written
    /// immediately, declaring `chunks` chunks plus the CRC32 chunk if any.
    pub(crate) fn open(
        target: OutputTarget<'a>,
        block_size: u32,
        len: u64,
        options: WriteOptions,
        chunks: u32,
    ) -> Result<Self> {
        if options.compressed {
            return Err(Error::not_supported("compressed output"));
        }

        let use_crc = options.chunked && options.checksum;
        let chunks_declared = chunks
            .checked_add(use_crc as u32)
            .ok_or_else(|| Error::overflow("chunk count"))?;

        let mut writer = Self {
            target,
            chunked: options.chunked,
            checksum: use_crc.then(Checksum::new),
            block_size: block_size as u64,
            len,
            position: 0,
            chunks_declared,
            chunks_written: 0,
            zero_buf: alloc_buffer(ZERO_BUFFER_SIZE)?,
            fill_buf: Vec::new(),
            dry_run: false,
        };

        tracing::debug!(
            chunked = options.chunked,
            checksum = use_crc,
            block_size,
            len,
            chunks = chunks_declared,
            "opening image output"
        );

        if writer.chunked {
            let total_blocks = div_round_up(len, writer.block_size);
            let total_blocks = u32::try_from(total_blocks)
                .map_err(|_| Error::overflow(format!("{} blocks", total_blocks)))?;
            let header = SparseHeader::new(block_size, total_blocks, chunks_declared);
            writer.target.write_all(&header.to_bytes())?;
        }

        Ok(writer)
    }

    fn chunk_header(&mut self, chunk_type: ChunkType, blocks: u64, payload_len: u64) -> Result<()> {
        let blocks = u32::try_from(blocks)
            .map_err(|_| Error::overflow(format!("{} blocks in one chunk", blocks)))?;
        let payload = u32::try_from(payload_len)
            .ok()
            .filter(|p| p.checked_add(crate::format::CHUNK_HEADER_LEN as u32).is_some())
            .ok_or_else(|| Error::overflow(format!("{} byte chunk payload", payload_len)))?;

        let header = ChunkHeader::new(chunk_type, blocks, payload);
        self.target.write_all(&header.to_bytes())?;
        self.chunks_written += 1;
        Ok(())
    }

    /// Stops reading file and stream payloads. Only the output length stays
    /// meaningful.
    pub(crate) fn set_dry_run(&mut self) {
        self.dry_run = true;
    }

    /// Emits one region.
    pub(crate) fn write_region(&mut self, region: &Region<'_>) -> Result<()> {
        let len = region.len();
        match region.backing() {
            Backing::File { .. } | Backing::Stream { .. } if self.dry_run => {
                self.write_payload(len, |_| Ok(()))
            }
            Backing::Data { buf, offset } => {
                let end = usize::try_from(len)
                    .ok()
                    .and_then(|l| offset.checked_add(l))
                    .ok_or_else(|| Error::overflow("data region length"))?;
                let bytes = buf.bytes().get(*offset..end).ok_or_else(|| {
                    Error::overflow(format!("data region {}..{} out of bounds", offset, end))
                })?;
                self.write_data(bytes)
            }
            Backing::File { path, offset } => self.write_file(path, *offset, len),
            Backing::Stream { source, offset } => self.write_stream(source, *offset, len),
            Backing::Fill(value) => self.write_fill(*value, len),
        }
    }

    /// Emits literal bytes.
    pub(crate) fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        if self.chunked {
            let aligned = align(len, self.block_size);
            self.chunk_header(ChunkType::Raw, aligned / self.block_size, aligned)?;
        }

        let start = self.position;
        self.target.write_all(data)?;
        self.checksum = self.checksum.map(|crc| crc.update(data));
        self.position += len;
        self.finish_payload(start, len)
    }

    /// Emits `len` bytes read from `source` at `offset`.
    pub(crate) fn write_stream(&mut self, source: &Source, offset: u64, len: u64) -> Result<()> {
        if !source.can_seek() {
            return Err(Error::not_seekable(format!(
                "stream region at offset {} needs a seekable source",
                offset
            )));
        }
        source.seek_to(offset)?;
        self.write_payload(len, |buf| source.read_exact(buf))
    }

    /// Emits `len` bytes read from the file at `path` at `offset`.
    pub(crate) fn write_file(&mut self, path: &Path, offset: u64, len: u64) -> Result<()> {
        let mut file = File::open(path).map_err(|e| Error::io(e, path))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io(e, path))?;
        self.write_payload(len, |buf| {
            file.read_exact(buf).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    Error::unexpected_eof(format!("'{}'", path.display()))
                } else {
                    Error::io(e, path)
                }
            })
        })
    }

    fn write_payload(
        &mut self,
        len: u64,
        mut fill: impl FnMut(&mut [u8]) -> Result<()>,
    ) -> Result<()> {
        if self.chunked {
            let aligned = align(len, self.block_size);
            self.chunk_header(ChunkType::Raw, aligned / self.block_size, aligned)?;
        }

        let start = self.position;
        let mut buf = alloc_buffer(len.min(COPY_BUFFER_SIZE as u64) as usize)?;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            fill(&mut buf[..n])?;
            self.target.write_all(&buf[..n])?;
            self.checksum = self.checksum.map(|crc| crc.update(&buf[..n]));
            remaining -= n as u64;
        }
        self.position += len;
        self.finish_payload(start, len)
    }

    /// Completes a payload of `len` bytes that began at logical `start`.
    fn finish_payload(&mut self, start: u64, len: u64) -> Result<()> {
        let aligned = align(len, self.block_size);

        if self.chunked {
            let tail = aligned - len;
            if tail > 0 {
                self.target.write_zeros(tail, &self.zero_buf)?;
                self.checksum = self.checksum.map(|crc| crc.update_zeros(tail));
            }
            self.position = start + aligned;
            return Ok(());
        }

        // Flat output stops at the logical end even mid-block.
        let end = (start + aligned).min(self.len.max(self.position));
        if end > self.position {
            self.target.skip(end - self.position, &self.zero_buf)?;
            self.position = end;
        }
        Ok(())
    }

    /// Emits `len` bytes of `value` repeated.
    pub(crate) fn write_fill(&mut self, value: u32, len: u64) -> Result<()> {
        if self.chunked {
            let aligned = align(len, self.block_size);
            self.chunk_header(ChunkType::Fill, aligned / self.block_size, 4)?;
            self.target.write_all(&value.to_le_bytes())?;
            self.checksum = self.checksum.map(|crc| crc.update_fill(value, aligned));
            self.position += aligned;
            return Ok(());
        }

        if self.fill_buf.is_empty() {
            self.fill_buf = alloc_buffer(ZERO_BUFFER_SIZE)?;
        }
        for word in self.fill_buf.chunks_exact_mut(4) {
            word.copy_from_slice(&value.to_le_bytes());
        }

        let start = self.position;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(self.fill_buf.len() as u64) as usize;
            self.target.write_all(&self.fill_buf[..n])?;
            remaining -= n as u64;
        }
        self.position += len;
        self.finish_payload(start, len)
    }

    /// Emits `len` bytes of implicit zeros.
    pub(crate) fn write_skip(&mut self, len: u64) -> Result<()> {
        if self.chunked {
            let blocks = div_round_up(len, self.block_size);
            let expanded = blocks * self.block_size;
            self.chunk_header(ChunkType::DontCare, blocks, 0)?;
            self.checksum = self.checksum.map(|crc| crc.update_zeros(expanded));
            self.position += expanded;
            return Ok(());
        }

        self.target.skip(len, &self.zero_buf)?;
        self.position += len;
        Ok(())
    }

    /// Ends the encode: writes the CRC32 chunk in chunked mode, or pads the
    /// output to the logical length in flat mode.
    pub(crate) fn finish(mut self) -> Result<()> {
        if self.chunked {
            if let Some(crc) = self.checksum {
                self.chunk_header(ChunkType::Crc32, 0, 4)?;
                self.target.write_all(&crc.value().to_le_bytes())?;
            }
            if self.chunks_written != self.chunks_declared {
                return Err(Error::invalid_argument(format!(
                    "wrote {} chunks but the header declared {}",
                    self.chunks_written, self.chunks_declared
                )));
            }
        } else {
            self.target.pad(self.len, self.position)?;
        }

        self.target.flush()?;
        tracing::debug!(
            chunks = self.chunks_written,
            position = self.position,
            "image output complete"
        );
        Ok(())
    }
}

/// Adapts a write callback to [`Write`].
pub(crate) struct CallbackWriter<F>(pub(crate) F);

impl<F: FnMut(&[u8]) -> io::Result<()>> Write for CallbackWriter<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (self.0)(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A sink that only counts the bytes pushed into it.
#[derive(Debug, Default)]
pub(crate) struct ByteCounter(pub(crate) u64);

impl Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::format::{CHUNK_HEADER_LEN, SPARSE_HEADER_LEN};

    const BS: u32 = 4096;

    #[test]
    fn test_write_options_presets() {
        assert_eq!(WriteOptions::default(), WriteOptions::sparse());
        assert!(WriteOptions::sparse_with_checksum().checksum);
        assert!(!WriteOptions::raw().chunked);
    }

    #[test]
    fn test_progress_percent() {
        let progress = WriteProgress {
            bytes_processed: 512,
            bytes_total: 1024,
        };
        assert_eq!(progress.percent_complete(), 50.0);
        let empty = WriteProgress {
            bytes_processed: 0,
            bytes_total: 0,
        };
        assert_eq!(empty.percent_complete(), 100.0);
    }

    #[test]
    fn test_compressed_not_supported() {
        let mut out = Vec::new();
        let options = WriteOptions {
            compressed: true,
            ..WriteOptions::sparse()
        };
        let err = ChunkWriter::open(OutputTarget::Stream(&mut out), BS, 4096, options, 0)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_count_chunks() {
        let mut list = RegionList::new(BS);
        assert_eq!(count_chunks(&list, 0).unwrap(), 0);
        assert_eq!(count_chunks(&list, 4096).unwrap(), 1);

        list.add_fill(1, 4096, 2).unwrap();
        list.add_fill(2, 4096, 3).unwrap();
        // skip, fill, fill, trailing skip
        assert_eq!(count_chunks(&list, 8 * 4096).unwrap(), 4);
        // no trailing skip when the last region reaches the end
        assert_eq!(count_chunks(&list, 4 * 4096).unwrap(), 3);
    }

    #[test]
    fn test_chunked_skip_rounds_up() {
        let mut out = Vec::new();
        let mut writer =
            ChunkWriter::open(OutputTarget::Stream(&mut out), BS, 5000, WriteOptions::sparse(), 1)
                .unwrap();
        writer.write_skip(5000).unwrap();
        writer.finish().unwrap();

        assert_eq!(out.len(), SPARSE_HEADER_LEN + CHUNK_HEADER_LEN);
        let header = SparseHeader::from_bytes(&out).unwrap();
        assert_eq!(header.total_blocks, 2);
        let chunk = ChunkHeader::from_bytes(&out[SPARSE_HEADER_LEN..]).unwrap();
        assert_eq!(chunk.chunk_blocks, 2);
    }

    #[test]
    fn test_chunk_count_mismatch_detected() {
        let mut out = Vec::new();
        let writer =
            ChunkWriter::open(OutputTarget::Stream(&mut out), BS, 4096, WriteOptions::sparse(), 1)
                .unwrap();
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_push_only_pad_rejected_when_resizing() {
        let mut out = Vec::new();
        let mut writer =
            ChunkWriter::open(OutputTarget::Stream(&mut out), BS, 100, WriteOptions::raw(), 0)
                .unwrap();
        writer.write_data(&[1u8; 200]).unwrap();
        let err = writer.finish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_flat_seekable_truncates() {
        let mut out = Cursor::new(Vec::new());
        let mut writer =
            ChunkWriter::open(OutputTarget::Seekable(&mut out), BS, 100, WriteOptions::raw(), 0)
                .unwrap();
        writer.write_data(&[1u8; 200]).unwrap();
        writer.finish().unwrap();
        assert_eq!(out.into_inner(), vec![1u8; 100]);
    }

    #[test]
    fn test_flat_fill_and_skip() {
        let mut out = Vec::new();
        let mut writer =
            ChunkWriter::open(OutputTarget::Stream(&mut out), 8, 24, WriteOptions::raw(), 0)
                .unwrap();
        writer.write_fill(0x04030201, 8).unwrap();
        writer.write_skip(8).unwrap();
        writer.write_data(&[9, 9]).unwrap();
        writer.finish().unwrap();
        assert_eq!(
            out,
            vec![1, 2, 3, 4, 1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0, 9, 9, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_callback_writer_and_counter() {
        let mut seen = Vec::new();
        let mut writer = CallbackWriter(|buf: &[u8]| -> io::Result<()> {
            seen.extend_from_slice(buf);
            Ok(())
        });
        writer.write_all(b"abc").unwrap();
        drop(writer);
        assert_eq!(seen, b"abc");

        let mut counter = ByteCounter::default();
        counter.write_all(&[0u8; 10]).unwrap();
        assert_eq!(counter.0, 10);
    }
}

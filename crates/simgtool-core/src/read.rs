//! Sparse and flat image decoder.
//!
//! Chunked input is validated header-first and then walked chunk by chunk.
//! RAW payloads are never copied: over a [`Source`] they become stream-backed
//! regions that the encoder re-reads later, and over an in-memory buffer they
//! become data regions sharing that buffer.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::diag::{Diagnostics, Silent};
use crate::error::{Error, Result};
use crate::format::{
    alloc_buffer, Checksum, ChunkHeader, ChunkType, SparseHeader, CHUNK_HEADER_LEN,
    SPARSE_HEADER_LEN,
};
use crate::image::{SparseImage, DEFAULT_BLOCK_SIZE};
use crate::region::{RegionList, SharedBuf};
use crate::source::Source;
use crate::write::COPY_BUFFER_SIZE;

/// How [`SparseImage::read`] interprets its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// A flat image, scanned block by block for repeated words.
    Raw,
    /// A chunked sparse image.
    Sparse,
    /// A flat image whose holes are detected by the filesystem. Not implemented.
    Hole,
}

/// Byte input the chunk walker reads from.
trait ChunkInput<'src> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    fn skip(&mut self, len: u64) -> Result<()>;

    fn offset(&self) -> u64;

    fn rewind(&mut self) -> Result<()>;

    /// Records the next `len` bytes as a region at `block` and moves past
    /// them, folding them into `crc` if present.
    fn add_payload(
        &mut self,
        regions: &mut RegionList<'src>,
        len: u64,
        block: u32,
        crc: Option<Checksum>,
    ) -> Result<Option<Checksum>>;
}

struct StreamInput<'src> {
    source: &'src Source,
}

impl<'src> ChunkInput<'src> for StreamInput<'src> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.source.read_exact(buf)
    }

    fn skip(&mut self, len: u64) -> Result<()> {
        self.source.skip(len)
    }

    fn offset(&self) -> u64 {
        self.source.offset()
    }

    fn rewind(&mut self) -> Result<()> {
        self.source.rewind()
    }

    fn add_payload(
        &mut self,
        regions: &mut RegionList<'src>,
        len: u64,
        block: u32,
        crc: Option<Checksum>,
    ) -> Result<Option<Checksum>> {
        regions.add_stream(self.source, self.source.offset(), len, block)?;

        let Some(mut crc) = crc else {
            self.source.skip(len)?;
            return Ok(None);
        };

        let mut buf = alloc_buffer(len.min(COPY_BUFFER_SIZE as u64) as usize)?;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            self.source.read_exact(&mut buf[..n])?;
            crc = crc.update(&buf[..n]);
            remaining -= n as u64;
        }
        Ok(Some(crc))
    }
}

struct BufferInput {
    buf: SharedBuf,
    pos: usize,
}

impl BufferInput {
    /// Bounds-checks `len` bytes at the current position.
    fn span(&self, len: u64) -> Result<std::ops::Range<usize>> {
        usize::try_from(len)
            .ok()
            .and_then(|len| self.pos.checked_add(len))
            .filter(|&end| end <= self.buf.len())
            .map(|end| self.pos..end)
            .ok_or_else(|| {
                Error::unexpected_eof(format!("{} bytes at buffer offset {}", len, self.pos))
            })
    }
}

impl<'src> ChunkInput<'src> for BufferInput {
    fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let span = self.span(out.len() as u64)?;
        out.copy_from_slice(&self.buf.bytes()[span.clone()]);
        self.pos = span.end;
        Ok(())
    }

    fn skip(&mut self, len: u64) -> Result<()> {
        self.pos = self.span(len)?.end;
        Ok(())
    }

    fn offset(&self) -> u64 {
        self.pos as u64
    }

    fn rewind(&mut self) -> Result<()> {
        self.pos = 0;
        Ok(())
    }

    fn add_payload(
        &mut self,
        regions: &mut RegionList<'src>,
        len: u64,
        block: u32,
        crc: Option<Checksum>,
    ) -> Result<Option<Checksum>> {
        let span = self.span(len)?;
        regions.add_data(self.buf.clone(), span.start, len, block)?;
        let crc = crc.map(|crc| crc.update(&self.buf.bytes()[span.clone()]));
        self.pos = span.end;
        Ok(crc)
    }
}

/// Reads and validates a sparse header from the current position.
fn parse_header(input: &mut dyn ChunkInput<'_>, diag: &dyn Diagnostics) -> Result<SparseHeader> {
    let mut raw = [0u8; SPARSE_HEADER_LEN];
    if let Err(e) = input.read_exact(&mut raw) {
        diag.emit(&format!("{} at header", e));
        return Err(e);
    }

    let header = SparseHeader::from_bytes(&raw)?;
    if let Err(e) = header.validate() {
        diag.emit(&e.to_string());
        return Err(e);
    }
    Ok(header)
}

/// Reads the sparse header at the current position of `source` and checks
/// that a decoder would accept it.
pub fn probe(source: &Source) -> Result<SparseHeader> {
    parse_header(&mut StreamInput { source }, &Silent)
}

impl<'src> SparseImage<'src> {
    /// Decodes a chunked sparse image from `source`.
    ///
    /// The header is checked first, then the source is rewound and decoded
    /// in full, so the source must be seekable. RAW chunks become regions
    /// referencing `source`, which must therefore outlive the image.
    pub fn import(source: &'src Source, checksum: bool, diag: &dyn Diagnostics) -> Result<Self> {
        let mut input = StreamInput { source };
        Self::import_input(&mut input, checksum, diag)
    }

    /// Decodes a chunked sparse image held in memory. RAW chunks become data
    /// regions sharing `buf`.
    pub fn import_buf(
        buf: impl Into<SharedBuf>,
        checksum: bool,
        diag: &dyn Diagnostics,
    ) -> Result<Self> {
        let mut input = BufferInput {
            buf: buf.into(),
            pos: 0,
        };
        Self::import_input(&mut input, checksum, diag)
    }

    /// Memory-maps the file at `path` and decodes it as a chunked sparse image.
    pub fn import_mapped(path: &Path, checksum: bool, diag: &dyn Diagnostics) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let size = file.metadata().map_err(|e| Error::io(e, path))?.len();
        if size == 0 {
            return Err(Error::unexpected_eof(format!(
                "sparse header of empty file '{}'",
                path.display()
            )));
        }

        // Safety: the file is opened read-only here and the map is only read.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };
        tracing::debug!(path = %path.display(), size, "mapped sparse image");

        Self::import_buf(mmap, checksum, diag)
    }

    /// Decodes `source` as a chunked sparse image if it starts with a valid
    /// sparse header, and as a flat image otherwise.
    ///
    /// Flat input uses [`DEFAULT_BLOCK_SIZE`] and the source length as the
    /// logical length. Both paths need to rewind, so a sequential source
    /// fails with [`ErrorKind::NotSeekable`](crate::ErrorKind::NotSeekable).
    pub fn import_auto(source: &'src Source, checksum: bool, diag: &dyn Diagnostics) -> Result<Self> {
        match probe(source) {
            Ok(_) => {
                source.rewind()?;
                Self::import(source, checksum, diag)
            }
            Err(e) => {
                tracing::debug!("not a sparse image ({}), reading as raw", e);
                if !source.can_seek() {
                    return Err(Error::not_seekable(
                        "raw fallback needs to rewind the input",
                    ));
                }
                source.rewind()?;
                let len = source.len()?;
                let mut image = Self::new(DEFAULT_BLOCK_SIZE, len)?;
                image.read_raw(source)?;
                Ok(image)
            }
        }
    }

    /// Adds the contents of `source` to this image.
    ///
    /// In [`ReadMode::Sparse`] the input's block size must equal the image's.
    /// A checksum can only be verified in that mode. Sparse input is read in
    /// a single forward pass, so a sequential source works here. On failure
    /// the image is left unchanged.
    pub fn read(
        &mut self,
        source: &'src Source,
        mode: ReadMode,
        checksum: bool,
        diag: &dyn Diagnostics,
    ) -> Result<()> {
        if checksum && mode != ReadMode::Sparse {
            return Err(Error::invalid_argument(format!(
                "checksum verification needs sparse input, not {:?}",
                mode
            )));
        }

        // Decode aside so a failure leaves this image untouched.
        let mut scratch = Self::new(self.block_size(), self.len())?;
        match mode {
            ReadMode::Sparse => scratch.read_chunks(&mut StreamInput { source }, checksum, diag)?,
            ReadMode::Raw => scratch.read_raw(source)?,
            ReadMode::Hole => return Err(Error::not_supported("hole-aware raw input")),
        }

        self.regions_mut().absorb(scratch.into_regions())
    }

    fn import_input(
        input: &mut dyn ChunkInput<'src>,
        checksum: bool,
        diag: &dyn Diagnostics,
    ) -> Result<Self> {
        let header = parse_header(input, diag)?;
        tracing::debug!(
            block_size = header.block_size,
            total_blocks = header.total_blocks,
            total_chunks = header.total_chunks,
            "parsed sparse header"
        );

        let mut image = Self::new(header.block_size, header.logical_len())?;

        if let Err(e) = input.rewind() {
            diag.emit(&format!("{} at seeking", e));
            return Err(e);
        }

        image.read_chunks(input, checksum, diag)?;
        Ok(image)
    }

    fn read_chunks(
        &mut self,
        input: &mut dyn ChunkInput<'src>,
        checksum: bool,
        diag: &dyn Diagnostics,
    ) -> Result<()> {
        let header = parse_header(input, diag)?;
        if header.block_size != self.block_size() {
            return Err(Error::invalid_argument(format!(
                "block size {} does not match image block size {}",
                header.block_size,
                self.block_size()
            )));
        }
        input.skip(header.excess_header_bytes())?;

        let mut crc = checksum.then(Checksum::new);
        let mut cur_block = 0u32;

        for _ in 0..header.total_chunks {
            let mut raw = [0u8; CHUNK_HEADER_LEN];
            input.read_exact(&mut raw)?;
            let chunk = ChunkHeader::from_bytes(&raw)?;
            input.skip(header.excess_chunk_header_bytes())?;

            let offset = input.offset();
            let (blocks, next_crc) = match process_chunk(
                self.regions_mut(),
                input,
                &header,
                &chunk,
                cur_block,
                crc,
                diag,
            ) {
                Ok(step) => step,
                Err(e) => {
                    let what = match chunk.kind() {
                        Some(ChunkType::Raw) => "data",
                        Some(ChunkType::Fill) => "fill",
                        Some(ChunkType::DontCare) => "skip",
                        Some(ChunkType::Crc32) => "crc",
                        None => "unknown",
                    };
                    diag.emit(&format!("{} at {} block at {}", e, what, offset));
                    return Err(e);
                }
            };
            crc = next_crc;

            cur_block = cur_block.checked_add(blocks).ok_or_else(|| {
                Error::overflow(format!("block {} plus {} chunk blocks", cur_block, blocks))
            })?;
        }

        if cur_block != header.total_blocks {
            let e = Error::invalid_argument(format!(
                "chunks cover {} blocks but the header declares {}",
                cur_block, header.total_blocks
            ));
            diag.emit(&e.to_string());
            return Err(e);
        }

        Ok(())
    }

    /// Scans a flat image of `self.len()` bytes in block-size windows.
    fn read_raw(&mut self, source: &'src Source) -> Result<()> {
        let block_size = self.block_size();
        let mut buf = alloc_buffer(block_size as usize)?;
        let mut remaining = self.len();
        let mut offset = source.offset();
        let mut block = 0u32;

        while remaining > 0 {
            let n = remaining.min(block_size as u64) as usize;
            source.read_exact(&mut buf[..n])?;

            let first = &buf[..4];
            if n == block_size as usize && buf.chunks_exact(4).all(|word| word == first) {
                let value = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                self.regions_mut().add_fill(value, n as u64, block)?;
            } else {
                self.regions_mut().add_stream(source, offset, n as u64, block)?;
            }

            remaining -= n as u64;
            offset += n as u64;
            if remaining > 0 {
                block = block
                    .checked_add(1)
                    .ok_or_else(|| Error::overflow("raw image exceeds block address space"))?;
            }
        }

        tracing::debug!(
            regions = self.regions().len(),
            len = self.len(),
            "scanned raw image"
        );
        Ok(())
    }
}

/// Handles one chunk starting at `block`. Returns the number of blocks it
/// covers and the updated checksum.
fn process_chunk<'src>(
    regions: &mut RegionList<'src>,
    input: &mut dyn ChunkInput<'src>,
    header: &SparseHeader,
    chunk: &ChunkHeader,
    block: u32,
    crc: Option<Checksum>,
    diag: &dyn Diagnostics,
) -> Result<(u32, Option<Checksum>)> {
    let payload = chunk.payload_len(header.chunk_header_size)?;
    let block_size = header.block_size;
    let len = chunk.chunk_blocks as u64 * block_size as u64;

    match chunk.kind() {
        Some(ChunkType::Raw) => {
            if payload % block_size != 0 || payload / block_size != chunk.chunk_blocks {
                return Err(Error::invalid_argument(format!(
                    "raw chunk of {} blocks carries {} bytes",
                    chunk.chunk_blocks, payload
                )));
            }
            let crc = if len > 0 {
                input.add_payload(regions, len, block, crc)?
            } else {
                crc
            };
            Ok((chunk.chunk_blocks, crc))
        }
        Some(ChunkType::Fill) => {
            if payload != 4 {
                return Err(Error::invalid_argument(format!(
                    "fill chunk payload of {} bytes",
                    payload
                )));
            }
            let mut word = [0u8; 4];
            input.read_exact(&mut word)?;
            let value = u32::from_le_bytes(word);
            if len > 0 {
                regions.add_fill(value, len, block)?;
            }
            Ok((chunk.chunk_blocks, crc.map(|crc| crc.update_fill(value, len))))
        }
        Some(ChunkType::DontCare) => {
            if payload != 0 {
                return Err(Error::invalid_argument(format!(
                    "don't-care chunk payload of {} bytes",
                    payload
                )));
            }
            Ok((chunk.chunk_blocks, crc.map(|crc| crc.update_zeros(len))))
        }
        Some(ChunkType::Crc32) => {
            if payload != 4 {
                return Err(Error::invalid_argument(format!(
                    "crc chunk payload of {} bytes",
                    payload
                )));
            }
            let mut word = [0u8; 4];
            input.read_exact(&mut word)?;
            let expected = u32::from_le_bytes(word);
            match crc {
                Some(actual) if actual.value() != expected => Err(Error::ChecksumMismatch {
                    expected,
                    actual: actual.value(),
                }),
                _ => Ok((0, crc)),
            }
        }
        None => {
            diag.emit(&format!(
                "unknown chunk type {:04x} at {}, skipping {} bytes",
                chunk.chunk_type,
                input.offset(),
                payload
            ));
            input.skip(payload as u64)?;
            Ok((0, crc))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::cell::RefCell;
    use std::io::Cursor;

    fn sparse_bytes(block_size: u32, total_blocks: u32, chunks: &[(ChunkHeader, Vec<u8>)]) -> Vec<u8> {
        let mut out = SparseHeader::new(block_size, total_blocks, chunks.len() as u32)
            .to_bytes()
            .to_vec();
        for (header, payload) in chunks {
            out.extend_from_slice(&header.to_bytes());
            out.extend_from_slice(payload);
        }
        out
    }

    #[test]
    fn test_buffer_input_bounds() {
        let mut input = BufferInput {
            buf: SharedBuf::from(vec![1u8, 2, 3, 4]),
            pos: 0,
        };
        let mut out = [0u8; 3];
        ChunkInput::read_exact(&mut input, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        let err = ChunkInput::read_exact(&mut input, &mut out).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Overflow);
        assert!(ChunkInput::skip(&mut input, 2).is_err());
        ChunkInput::rewind(&mut input).unwrap();
        assert_eq!(ChunkInput::offset(&input), 0);
    }

    #[test]
    fn test_import_buf_fill_and_raw() {
        let data = vec![7u8; 8];
        let bytes = sparse_bytes(
            8,
            3,
            &[
                (ChunkHeader::new(ChunkType::Fill, 1, 4), 0xaau32.to_le_bytes().to_vec()),
                (ChunkHeader::new(ChunkType::DontCare, 1, 0), Vec::new()),
                (ChunkHeader::new(ChunkType::Raw, 1, 8), data),
            ],
        );

        let image = SparseImage::import_buf(bytes, true, &Silent).unwrap();
        assert_eq!(image.block_size(), 8);
        assert_eq!(image.len(), 24);
        assert_eq!(image.regions().len(), 2);
        assert_eq!(image.regions().get(1).unwrap().start_block(), 2);
    }

    #[test]
    fn test_unknown_chunk_is_skipped() {
        let lines = RefCell::new(Vec::new());
        let sink = |line: &str| lines.borrow_mut().push(line.to_string());

        let unknown = ChunkHeader {
            chunk_type: 0xcac9,
            reserved: 0,
            chunk_blocks: 0,
            total_size: 12 + 6,
        };
        let bytes = sparse_bytes(
            4,
            1,
            &[
                (unknown, vec![0xff; 6]),
                (ChunkHeader::new(ChunkType::Fill, 1, 4), vec![1, 2, 3, 4]),
            ],
        );

        let image = SparseImage::import_buf(bytes, false, &sink).unwrap();
        assert_eq!(image.regions().len(), 1);
        assert_eq!(lines.borrow().len(), 1);
        assert!(lines.borrow()[0].contains("unknown chunk type cac9"));
    }

    #[test]
    fn test_raw_chunk_size_mismatch() {
        let bytes = sparse_bytes(
            8,
            2,
            &[(ChunkHeader::new(ChunkType::Raw, 2, 8), vec![0u8; 8])],
        );
        let err = SparseImage::import_buf(bytes, false, &Silent).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_excess_header_bytes_skipped() {
        let mut header = SparseHeader::new(4, 1, 1);
        header.file_header_size = 32;
        header.chunk_header_size = 16;

        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(&[0xee; 4]);
        let mut chunk = ChunkHeader::new(ChunkType::Fill, 1, 4);
        chunk.total_size = 16 + 4;
        bytes.extend_from_slice(&chunk.to_bytes());
        bytes.extend_from_slice(&[0xee; 4]);
        bytes.extend_from_slice(&9u32.to_le_bytes());

        let image = SparseImage::import_buf(bytes, true, &Silent).unwrap();
        assert_eq!(image.regions().len(), 1);
    }

    #[test]
    fn test_read_mode_checks() {
        let source = Source::seekable(Cursor::new(vec![0u8; 16]));
        let mut image = SparseImage::new(4, 16).unwrap();

        let err = image.read(&source, ReadMode::Raw, true, &Silent).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = image.read(&source, ReadMode::Hole, false, &Silent).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);

        image.read(&source, ReadMode::Raw, false, &Silent).unwrap();
        assert_eq!(image.regions().len(), 1);
    }

    #[test]
    fn test_sparse_read_block_size_mismatch() {
        let bytes = sparse_bytes(8, 1, &[(ChunkHeader::new(ChunkType::DontCare, 1, 0), Vec::new())]);
        let source = Source::seekable(Cursor::new(bytes));
        let mut image = SparseImage::new(4, 8).unwrap();
        let err = image
            .read(&source, ReadMode::Sparse, false, &Silent)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_probe_rejects_raw() {
        let source = Source::seekable(Cursor::new(vec![0u8; 64]));
        assert_eq!(probe(&source).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }
}

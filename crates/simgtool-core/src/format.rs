//! Sparse image wire format.
//!
//! A sparse image is a 28-byte file header followed by `total_chunks` chunks,
//! each a 12-byte chunk header plus an optional payload. All fields are
//! little-endian.
//!
//! ```text
//! +-------------------+  magic | major | minor | hdr_sz | chunk_hdr_sz
//! | file header (28)  |  blk_sz | total_blks | total_chunks | checksum
//! +-------------------+
//! | chunk header (12) |  type | reserved | chunk_blocks | total_size
//! | payload           |  RAW: blocks * blk_sz, FILL/CRC32: 4, DONT_CARE: 0
//! +-------------------+
//! | ...               |
//! ```

use crate::error::{Error, Result};

/// Sparse image magic number.
pub const SPARSE_HEADER_MAGIC: u32 = 0xed26ff3a;

/// Supported major version. Any other major version is rejected.
pub const MAJOR_VERSION: u16 = 1;

/// Minor version written to new images.
pub const MINOR_VERSION: u16 = 0;

/// Size of the file header this library understands and writes.
pub const SPARSE_HEADER_LEN: usize = 28;

/// Size of the chunk header this library understands and writes.
pub const CHUNK_HEADER_LEN: usize = 12;

/// Chunk types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ChunkType {
    /// Literal block data.
    Raw = 0xcac1,
    /// A 4-byte word repeated over the chunk's blocks.
    Fill = 0xcac2,
    /// Blocks whose content is not transmitted (zero when expanded).
    DontCare = 0xcac3,
    /// CRC32 of all logical bytes preceding this chunk.
    Crc32 = 0xcac4,
}

impl ChunkType {
    /// Map a raw chunk type field to a known chunk type.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0xcac1 => Some(ChunkType::Raw),
            0xcac2 => Some(ChunkType::Fill),
            0xcac3 => Some(ChunkType::DontCare),
            0xcac4 => Some(ChunkType::Crc32),
            _ => None,
        }
    }
}

/// Sparse image file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    /// Magic number (SPARSE_HEADER_MAGIC).
    pub magic: u32,
    /// Major version (1).
    pub major_version: u16,
    /// Minor version (0).
    pub minor_version: u16,
    /// Declared size of the file header in bytes.
    pub file_header_size: u16,
    /// Declared size of each chunk header in bytes.
    pub chunk_header_size: u16,
    /// Block size in bytes.
    pub block_size: u32,
    /// Number of blocks in the expanded image.
    pub total_blocks: u32,
    /// Number of chunks that follow the header.
    pub total_chunks: u32,
    /// Whole-image CRC32. Always written as 0.
    pub image_checksum: u32,
}

impl SparseHeader {
    /// Creates a header for a new image.
    pub fn new(block_size: u32, total_blocks: u32, total_chunks: u32) -> Self {
        Self {
            magic: SPARSE_HEADER_MAGIC,
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            file_header_size: SPARSE_HEADER_LEN as u16,
            chunk_header_size: CHUNK_HEADER_LEN as u16,
            block_size,
            total_blocks,
            total_chunks,
            image_checksum: 0,
        }
    }

    /// Parses the known header fields from the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SPARSE_HEADER_LEN {
            return Err(Error::unexpected_eof("sparse header"));
        }

        Ok(Self {
            magic: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            major_version: u16::from_le_bytes([data[4], data[5]]),
            minor_version: u16::from_le_bytes([data[6], data[7]]),
            file_header_size: u16::from_le_bytes([data[8], data[9]]),
            chunk_header_size: u16::from_le_bytes([data[10], data[11]]),
            block_size: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            total_blocks: u32::from_le_bytes([data[16], data[17], data[18], data[19]]),
            total_chunks: u32::from_le_bytes([data[20], data[21], data[22], data[23]]),
            image_checksum: u32::from_le_bytes([data[24], data[25], data[26], data[27]]),
        })
    }

    /// Serializes the header to exactly 28 bytes.
    pub fn to_bytes(&self) -> [u8; SPARSE_HEADER_LEN] {
        let mut buf = [0u8; SPARSE_HEADER_LEN];

        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.major_version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.minor_version.to_le_bytes());
        buf[8..10].copy_from_slice(&self.file_header_size.to_le_bytes());
        buf[10..12].copy_from_slice(&self.chunk_header_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.block_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.total_blocks.to_le_bytes());
        buf[20..24].copy_from_slice(&self.total_chunks.to_le_bytes());
        buf[24..28].copy_from_slice(&self.image_checksum.to_le_bytes());

        buf
    }

    /// Checks every field a reader depends on.
    pub fn validate(&self) -> Result<()> {
        if self.magic != SPARSE_HEADER_MAGIC {
            return Err(Error::invalid_argument(format!(
                "header magic: expected 0x{:08x}, got 0x{:08x}",
                SPARSE_HEADER_MAGIC, self.magic
            )));
        }

        if self.major_version != MAJOR_VERSION {
            return Err(Error::invalid_argument(format!(
                "header major version: {}",
                self.major_version
            )));
        }

        if (self.file_header_size as usize) < SPARSE_HEADER_LEN {
            return Err(Error::invalid_argument(format!(
                "file header size {} < {}",
                self.file_header_size, SPARSE_HEADER_LEN
            )));
        }

        if (self.chunk_header_size as usize) < CHUNK_HEADER_LEN {
            return Err(Error::invalid_argument(format!(
                "chunk header size {} < {}",
                self.chunk_header_size, CHUNK_HEADER_LEN
            )));
        }

        if self.block_size == 0 || self.block_size % 4 != 0 {
            return Err(Error::invalid_argument(format!(
                "block size {} is not a non-zero multiple of 4",
                self.block_size
            )));
        }

        if self.total_blocks == 0 {
            return Err(Error::invalid_argument("total blocks is zero"));
        }

        Ok(())
    }

    /// Bytes of declared file header beyond the fields we know.
    pub fn excess_header_bytes(&self) -> u64 {
        (self.file_header_size as u64).saturating_sub(SPARSE_HEADER_LEN as u64)
    }

    /// Bytes of declared chunk header beyond the fields we know.
    pub fn excess_chunk_header_bytes(&self) -> u64 {
        (self.chunk_header_size as u64).saturating_sub(CHUNK_HEADER_LEN as u64)
    }

    /// Length of the expanded image in bytes.
    pub fn logical_len(&self) -> u64 {
        self.total_blocks as u64 * self.block_size as u64
    }
}

/// Chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Raw chunk type field. Unknown values are preserved.
    pub chunk_type: u16,
    /// Reserved, written as 0.
    pub reserved: u16,
    /// Number of expanded blocks this chunk covers.
    pub chunk_blocks: u32,
    /// Size of the chunk on the wire, header included.
    pub total_size: u32,
}

impl ChunkHeader {
    /// Creates a header for a chunk carrying `payload_len` bytes.
    pub fn new(chunk_type: ChunkType, chunk_blocks: u32, payload_len: u32) -> Self {
        Self {
            chunk_type: chunk_type as u16,
            reserved: 0,
            chunk_blocks,
            total_size: CHUNK_HEADER_LEN as u32 + payload_len,
        }
    }

    /// Parses the known chunk header fields from the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CHUNK_HEADER_LEN {
            return Err(Error::unexpected_eof("chunk header"));
        }

        Ok(Self {
            chunk_type: u16::from_le_bytes([data[0], data[1]]),
            reserved: u16::from_le_bytes([data[2], data[3]]),
            chunk_blocks: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            total_size: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    /// Serializes the chunk header to exactly 12 bytes.
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_LEN] {
        let mut buf = [0u8; CHUNK_HEADER_LEN];

        buf[0..2].copy_from_slice(&self.chunk_type.to_le_bytes());
        buf[2..4].copy_from_slice(&self.reserved.to_le_bytes());
        buf[4..8].copy_from_slice(&self.chunk_blocks.to_le_bytes());
        buf[8..12].copy_from_slice(&self.total_size.to_le_bytes());

        buf
    }

    /// The chunk type, if it is one we know.
    pub fn kind(&self) -> Option<ChunkType> {
        ChunkType::from_u16(self.chunk_type)
    }

    /// Payload bytes following a chunk header of the declared size.
    pub fn payload_len(&self, chunk_header_size: u16) -> Result<u32> {
        self.total_size
            .checked_sub(chunk_header_size as u32)
            .ok_or_else(|| {
                Error::invalid_argument(format!(
                    "chunk total size {} smaller than chunk header size {}",
                    self.total_size, chunk_header_size
                ))
            })
    }
}

/// Running CRC32 over the expanded image.
///
/// Standard reflected CRC-32 seeded at zero. The value is threaded through a
/// single decode or encode pass by value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum(u32);

impl Checksum {
    /// A fresh checksum.
    pub fn new() -> Self {
        Self(0)
    }

    /// Returns the checksum after folding in `bytes`.
    pub fn update(self, bytes: &[u8]) -> Self {
        let mut hasher = crc32fast::Hasher::new_with_initial(self.0);
        hasher.update(bytes);
        Self(hasher.finalize())
    }

    /// Returns the checksum after folding in `len` bytes of `value` repeated.
    pub fn update_fill(self, value: u32, len: u64) -> Self {
        let mut pattern = [0u8; 4096];
        for word in pattern.chunks_exact_mut(4) {
            word.copy_from_slice(&value.to_le_bytes());
        }

        let mut hasher = crc32fast::Hasher::new_with_initial(self.0);
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(pattern.len() as u64) as usize;
            hasher.update(&pattern[..n]);
            remaining -= n as u64;
        }
        Self(hasher.finalize())
    }

    /// Returns the checksum after folding in `len` zero bytes.
    pub fn update_zeros(self, len: u64) -> Self {
        self.update_fill(0, len)
    }

    /// The current CRC32 value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Integer division rounding up.
#[inline]
pub fn div_round_up(x: u64, y: u64) -> u64 {
    x.div_ceil(y)
}

/// Rounds `x` up to a multiple of `y`.
#[inline]
pub fn align(x: u64, y: u64) -> u64 {
    y * div_round_up(x, y)
}

/// Rounds `x` down to a multiple of `y`.
#[inline]
pub fn align_down(x: u64, y: u64) -> u64 {
    y * (x / y)
}

/// Allocates a zeroed working buffer, reporting failure instead of aborting.
pub(crate) fn alloc_buffer(len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::out_of_memory(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

//! Block regions and the ordered, coalescing region list.
//!
//! An image is described by a list of regions, each covering a run of blocks
//! starting at `start_block` and backed by one of: an in-memory buffer, a
//! file, a shared [`Source`], or a repeating 32-bit fill word. Blocks not
//! covered by any region are zero.
//!
//! The list stays sorted by start block. New regions are coalesced with their
//! neighbours when both are backed by the same thing and are contiguous in
//! both block space and backing offset, so a flat image read block by block
//! collapses into a handful of long regions.

use std::fmt;
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{Error, Result};
use crate::format::{align, align_down, div_round_up, CHUNK_HEADER_LEN};
use crate::source::Source;

/// A cheaply clonable, shared, read-only byte buffer.
#[derive(Clone)]
pub struct SharedBuf(Arc<dyn AsRef<[u8]>>);

impl SharedBuf {
    /// The buffer contents.
    pub fn bytes(&self) -> &[u8] {
        AsRef::<[u8]>::as_ref(&*self.0)
    }

    /// Length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u8>> for SharedBuf {
    fn from(data: Vec<u8>) -> Self {
        Self(Arc::new(data))
    }
}

impl From<&[u8]> for SharedBuf {
    fn from(data: &[u8]) -> Self {
        Self(Arc::new(data.to_vec()))
    }
}

impl From<Mmap> for SharedBuf {
    fn from(map: Mmap) -> Self {
        Self(Arc::new(map))
    }
}

impl fmt::Debug for SharedBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuf").field("len", &self.len()).finish()
    }
}

/// What a region's bytes come from.
#[derive(Debug, Clone)]
pub enum Backing<'src> {
    /// Bytes held in memory, starting at `offset` within `buf`.
    Data { buf: SharedBuf, offset: usize },
    /// Bytes in a file, starting at byte `offset`. Opened at encode time.
    File { path: Arc<Path>, offset: u64 },
    /// Bytes in a shared source, starting at byte `offset`.
    Stream { source: &'src Source, offset: u64 },
    /// A little-endian 32-bit word repeated over the whole region.
    Fill(u32),
}

impl Backing<'_> {
    /// The same backing, `by` bytes further in.
    fn advanced(&self, by: u64) -> Result<Self> {
        let too_far = || Error::overflow(format!("backing offset overflow advancing by {}", by));
        Ok(match self {
            Backing::Data { buf, offset } => {
                let by = usize::try_from(by).map_err(|_| too_far())?;
                Backing::Data {
                    buf: buf.clone(),
                    offset: offset.checked_add(by).ok_or_else(too_far)?,
                }
            }
            Backing::File { path, offset } => Backing::File {
                path: Arc::clone(path),
                offset: offset.checked_add(by).ok_or_else(too_far)?,
            },
            Backing::Stream { source, offset } => Backing::Stream {
                source: *source,
                offset: offset.checked_add(by).ok_or_else(too_far)?,
            },
            Backing::Fill(value) => Backing::Fill(*value),
        })
    }

    /// Short name for listings.
    pub fn name(&self) -> &'static str {
        match self {
            Backing::Data { .. } => "data",
            Backing::File { .. } => "file",
            Backing::Stream { .. } => "stream",
            Backing::Fill(_) => "fill",
        }
    }
}

/// A run of blocks with a single backing.
#[derive(Debug, Clone)]
pub struct Region<'src> {
    start_block: u32,
    len: u64,
    backing: Backing<'src>,
}

impl<'src> Region<'src> {
    /// First block covered by this region.
    pub fn start_block(&self) -> u32 {
        self.start_block
    }

    /// Length in bytes. Only the last region of an image may end mid-block.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the region covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Where the bytes come from.
    pub fn backing(&self) -> &Backing<'src> {
        &self.backing
    }

    /// Number of blocks touched, counting a trailing partial block.
    pub fn block_count(&self, block_size: u32) -> u64 {
        div_round_up(self.len, block_size as u64)
    }

    /// One past the last block touched.
    pub fn end_block(&self, block_size: u32) -> u64 {
        self.start_block as u64 + self.block_count(block_size)
    }

    /// Bytes this region occupies as a single chunk of a sparse image.
    pub fn encoded_len(&self, block_size: u32) -> u64 {
        let payload = match self.backing {
            Backing::Fill(_) => 4,
            _ => align(self.len, block_size as u64),
        };
        CHUNK_HEADER_LEN as u64 + payload
    }
}

/// Sorted list of non-overlapping regions for one image.
#[derive(Debug)]
pub struct RegionList<'src> {
    regions: Vec<Region<'src>>,
    block_size: u32,
    /// Index of the most recently inserted region, used to resume the search
    /// for the insertion point when blocks arrive in increasing order.
    hint: Option<usize>,
}

impl<'src> RegionList<'src> {
    /// Creates an empty list for the given block size.
    pub fn new(block_size: u32) -> Self {
        Self {
            regions: Vec::new(),
            block_size,
            hint: None,
        }
    }

    /// Block size the list was created with.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the list holds no regions.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Region at `index`, in block order.
    pub fn get(&self, index: usize) -> Option<&Region<'src>> {
        self.regions.get(index)
    }

    /// Iterates the regions in block order.
    pub fn iter(&self) -> std::slice::Iter<'_, Region<'src>> {
        self.regions.iter()
    }

    /// Adds a region backed by `len` bytes of `buf` starting at `offset`.
    pub fn add_data(&mut self, buf: SharedBuf, offset: usize, len: u64, block: u32) -> Result<()> {
        let end = (offset as u64).checked_add(len);
        if end.map_or(true, |end| end > buf.len() as u64) {
            return Err(Error::overflow(format!(
                "data region {}+{} exceeds buffer of {} bytes",
                offset,
                len,
                buf.len()
            )));
        }
        self.insert(block, len, Backing::Data { buf, offset })
    }

    /// Adds a region filled with `value`.
    pub fn add_fill(&mut self, value: u32, len: u64, block: u32) -> Result<()> {
        self.insert(block, len, Backing::Fill(value))
    }

    /// Adds a region backed by `len` bytes of the file at `path`.
    pub fn add_file(&mut self, path: impl Into<PathBuf>, offset: u64, len: u64, block: u32) -> Result<()> {
        let path: Arc<Path> = Arc::from(path.into());
        self.insert(block, len, Backing::File { path, offset })
    }

    /// Adds a region backed by `len` bytes of `source` starting at `offset`.
    pub fn add_stream(&mut self, source: &'src Source, offset: u64, len: u64, block: u32) -> Result<()> {
        self.insert(block, len, Backing::Stream { source, offset })
    }

    fn insert(&mut self, start_block: u32, len: u64, backing: Backing<'src>) -> Result<()> {
        let region = Region {
            start_block,
            len,
            backing,
        };
        if region.end_block(self.block_size) > u32::MAX as u64 + 1 {
            return Err(Error::overflow(format!(
                "region at block {} of {} bytes exceeds the block address space",
                start_block, len
            )));
        }

        let index = self.insertion_index(start_block);

        match self.regions.get(index) {
            Some(next) if self.mergeable(&region, next) => {
                let next_len = next.len;
                let mut merged = region;
                merged.len += next_len;
                self.regions[index] = merged;
            }
            _ => self.regions.insert(index, region),
        }

        if index > 0 && self.mergeable(&self.regions[index - 1], &self.regions[index]) {
            let absorbed = self.regions.remove(index);
            self.regions[index - 1].len += absorbed.len;
            self.hint = Some(index - 1);
        } else {
            self.hint = Some(index);
        }

        Ok(())
    }

    /// Position before the first region starting at or after `start_block`.
    fn insertion_index(&self, start_block: u32) -> usize {
        let from = match self.hint {
            Some(hint) if self.regions.get(hint).map_or(false, |r| r.start_block < start_block) => {
                hint + 1
            }
            _ => 0,
        };
        from + self.regions[from..].partition_point(|r| r.start_block < start_block)
    }

    /// Whether `b` can be folded into `a`, which must directly precede it.
    fn mergeable(&self, a: &Region<'src>, b: &Region<'src>) -> bool {
        if a.start_block >= b.start_block {
            return false;
        }

        // Only a region ending on a block boundary can be extended.
        let block_size = self.block_size as u64;
        if a.len % block_size != 0 {
            return false;
        }
        if a.start_block as u64 + a.len / block_size != b.start_block as u64 {
            return false;
        }

        match (&a.backing, &b.backing) {
            (Backing::Fill(x), Backing::Fill(y)) => x == y,
            (
                Backing::File { path: pa, offset: oa },
                Backing::File { path: pb, offset: ob },
            ) => pa == pb && oa.checked_add(a.len) == Some(*ob),
            (
                Backing::Stream { source: sa, offset: oa },
                Backing::Stream { source: sb, offset: ob },
            ) => std::ptr::eq(*sa, *sb) && oa.checked_add(a.len) == Some(*ob),
            // Merging in-memory regions would need a copy.
            _ => false,
        }
    }

    /// Splits the region at `index` so that it is at most `max_len` bytes.
    ///
    /// `max_len` is rounded down to a whole number of blocks. The remainder
    /// becomes a new region directly after the original, backed by the same
    /// thing further in.
    pub fn split(&mut self, index: usize, max_len: u64) -> Result<()> {
        let max_len = align_down(max_len, self.block_size as u64);
        if max_len == 0 {
            return Err(Error::invalid_argument(format!(
                "split length below block size {}",
                self.block_size
            )));
        }

        let region = self.regions.get(index).ok_or_else(|| {
            Error::invalid_argument(format!("no region at index {}", index))
        })?;
        if region.len <= max_len {
            return Ok(());
        }

        let tail = Region {
            start_block: region.start_block + (max_len / self.block_size as u64) as u32,
            len: region.len - max_len,
            backing: region.backing.advanced(max_len)?,
        };

        self.regions[index].len = max_len;
        self.regions.insert(index + 1, tail);
        self.hint = None;
        Ok(())
    }

    /// Splits every region longer than `max_len`.
    pub fn split_all(&mut self, max_len: u64) -> Result<()> {
        let mut index = 0;
        while index < self.regions.len() {
            self.split(index, max_len)?;
            index += 1;
        }
        Ok(())
    }

    /// Moves the regions in `range` (by index) into `target`, keeping both
    /// lists sorted. Moved regions are not coalesced with their new
    /// neighbours.
    pub fn move_range(&mut self, target: &mut RegionList<'src>, range: impl RangeBounds<usize>) -> Result<()> {
        if target.block_size != self.block_size {
            return Err(Error::invalid_argument(format!(
                "cannot move regions between block sizes {} and {}",
                self.block_size, target.block_size
            )));
        }

        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&e) => e + 1,
            Bound::Excluded(&e) => e,
            Bound::Unbounded => self.regions.len(),
        };
        if start > end || end > self.regions.len() {
            return Err(Error::overflow(format!(
                "region range {}..{} out of bounds for {} regions",
                start,
                end,
                self.regions.len()
            )));
        }
        if start == end {
            return Ok(());
        }

        let moved: Vec<Region<'src>> = self.regions.drain(start..end).collect();
        let first_block = moved[0].start_block;
        let at = target
            .regions
            .partition_point(|r| r.start_block <= first_block);
        target.regions.splice(at..at, moved);

        self.hint = None;
        target.hint = None;
        Ok(())
    }

    /// Inserts every region of `other`, coalescing as individual inserts do.
    pub(crate) fn absorb(&mut self, other: RegionList<'src>) -> Result<()> {
        if other.block_size != self.block_size {
            return Err(Error::invalid_argument(format!(
                "cannot absorb regions of block size {} into block size {}",
                other.block_size, self.block_size
            )));
        }

        for region in other.regions {
            self.insert(region.start_block, region.len, region.backing)?;
        }
        Ok(())
    }
}

impl<'a, 'src> IntoIterator for &'a RegionList<'src> {
    type Item = &'a Region<'src>;
    type IntoIter = std::slice::Iter<'a, Region<'src>>;

    fn into_iter(self) -> Self::IntoIter {
        self.regions.iter()
    }
}

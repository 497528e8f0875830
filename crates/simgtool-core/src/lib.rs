//! simgtool Core Library
//!
//! This crate converts between Android sparse images and flat raw images.
//!
//! # Overview
//!
//! A sparse image is a chunked container: runs of literal blocks, runs of a
//! repeated 32-bit word, and runs of blocks that are not transmitted at all.
//! The library decodes such containers (or flat images) into a
//! [`SparseImage`], a block-ordered list of regions, and encodes a
//! [`SparseImage`] back to either form.
//!
//! # Modules
//!
//! - [`error`] - Error types, failure kinds and Result alias
//! - [`format`] - Wire format headers, CRC32 and alignment helpers
//! - [`region`] - Sorted, coalescing region list
//! - [`source`] - Seekable and sequential byte sources
//! - [`diag`] - Sinks for verbose decode diagnostics
//! - [`read`] - Decoder for chunked and flat input
//! - [`write`] - Encoder for chunked and flat output
//! - [`image`] - The image type tying decoder and encoder together
//!
//! # Quick Start
//!
//! ```no_run
//! use simgtool_core::{OutputTarget, Source, SparseImage, TracingDiagnostics, WriteOptions};
//! use std::fs::File;
//! use std::path::Path;
//!
//! let source = Source::open(Path::new("system.raw")).unwrap();
//! let mut image = SparseImage::import_auto(&source, false, &TracingDiagnostics).unwrap();
//!
//! let mut out = File::create("system.img").unwrap();
//! image
//!     .write(OutputTarget::Seekable(&mut out), WriteOptions::sparse(), None)
//!     .unwrap();
//! ```

pub mod diag;
pub mod error;
pub mod format;
pub mod image;
pub mod read;
pub mod region;
pub mod source;
pub mod write;

pub use diag::{Diagnostics, Silent, TracingDiagnostics};
pub use error::{Error, ErrorKind, Result};
pub use format::{Checksum, ChunkHeader, ChunkType, SparseHeader};
pub use image::{SparseImage, DEFAULT_BLOCK_SIZE, MAX_CHUNK_SIZE};
pub use read::{probe, ReadMode};
pub use region::{Backing, Region, RegionList, SharedBuf};
pub use source::Source;
pub use write::{OutputTarget, SeekableOutput, WriteOptions, WriteProgress};

/// Smallest block size the command line tools accept for new images.
pub const MIN_BLOCK_SIZE: u32 = 1024;

//! Tests for growing images and splitting them into size-limited pieces.

use simgtool_core::{
    Backing, ErrorKind, OutputTarget, Silent, Source, SparseImage, WriteOptions,
};
use std::io::Cursor;
use std::path::Path;

const BS: u32 = 4096;
const BSU: usize = BS as usize;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed) | 1).collect()
}

fn encode(image: &mut SparseImage<'_>, options: WriteOptions) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image
        .write(OutputTarget::Seekable(&mut out), options, None)
        .unwrap();
    out.into_inner()
}

fn write_sparse(path: &Path, image: &mut SparseImage<'_>) {
    let mut file = std::fs::File::create(path).unwrap();
    image
        .write(OutputTarget::Seekable(&mut file), WriteOptions::sparse(), None)
        .unwrap();
}

#[test]
fn test_append_raw_file_to_sparse_image() {
    let dir = tempfile::tempdir().unwrap();
    let sparse_path = dir.path().join("base.simg");
    let raw_path = dir.path().join("extra.raw");

    let mut base = SparseImage::new(BS, 4096).unwrap();
    base.add_fill(0x0badf00d, 4096, 0).unwrap();
    write_sparse(&sparse_path, &mut base);
    let base_flat = encode(&mut base, WriteOptions::raw());

    let extra = pattern(BSU, 3);
    std::fs::write(&raw_path, &extra).unwrap();

    let source = Source::open(&sparse_path).unwrap();
    let mut image = SparseImage::import_auto(&source, false, &Silent).unwrap();
    image.append_file(&raw_path).unwrap();

    assert_eq!(image.len(), 8192);
    let appended = image.regions().iter().last().unwrap();
    assert_eq!(appended.start_block(), 1);
    assert!(matches!(appended.backing(), Backing::File { .. }));

    let sparse = encode(&mut image, WriteOptions::sparse_with_checksum());
    let mut decoded = SparseImage::import_buf(sparse, true, &Silent).unwrap();
    assert_eq!(decoded.len(), 8192);

    let flat = encode(&mut decoded, WriteOptions::raw());
    assert_eq!(&flat[..BSU], &base_flat[..]);
    assert_eq!(&flat[BSU..], &extra[..]);
}

#[test]
fn test_append_to_raw_image() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = dir.path().join("base.raw");
    let extra_path = dir.path().join("extra.raw");

    let mut base = vec![0u8; BSU];
    base.extend_from_slice(&pattern(BSU, 7));
    let extra = pattern(2 * BSU, 9);
    std::fs::write(&base_path, &base).unwrap();
    std::fs::write(&extra_path, &extra).unwrap();

    let source = Source::open(&base_path).unwrap();
    let mut image = SparseImage::import_auto(&source, false, &Silent).unwrap();
    assert_eq!(image.len(), 8192);
    image.append_file(&extra_path).unwrap();
    assert_eq!(image.len(), 4 * 4096);

    let flat = encode(&mut image, WriteOptions::raw());
    assert_eq!(&flat[..2 * BSU], &base[..]);
    assert_eq!(&flat[2 * BSU..], &extra[..]);
}

#[test]
fn test_append_rejects_misaligned_input() {
    let dir = tempfile::tempdir().unwrap();
    let short_path = dir.path().join("short.raw");
    std::fs::write(&short_path, [1u8; 100]).unwrap();

    let mut image = SparseImage::new(BS, 4096).unwrap();
    let err = image.append_file(&short_path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(image.len(), 4096);

    let mut unaligned = SparseImage::new(BS, 4000).unwrap();
    let err = unaligned.append_file(&short_path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_append_empty_file_adds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let empty_path = dir.path().join("empty.raw");
    std::fs::write(&empty_path, b"").unwrap();

    let mut image = SparseImage::new(BS, 4096).unwrap();
    image.append_file(&empty_path).unwrap();
    assert_eq!(image.len(), 4096);
    assert!(image.regions().is_empty());
}

#[test]
fn test_append_missing_file() {
    let mut image = SparseImage::new(BS, 4096).unwrap();
    let err = image
        .append_file("/nonexistent/simgtool/extra.raw")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoDevice);
}

/// Expands every piece and ORs them together.
fn merge_pieces(pieces: &mut [SparseImage<'_>]) -> Vec<u8> {
    let mut merged: Vec<u8> = Vec::new();
    for piece in pieces.iter_mut() {
        let flat = encode(piece, WriteOptions::raw());
        if merged.is_empty() {
            merged = flat;
        } else {
            assert_eq!(flat.len(), merged.len());
            for (m, b) in merged.iter_mut().zip(flat) {
                *m |= b;
            }
        }
    }
    merged
}

#[test]
fn test_resparse_splits_single_region() {
    let data = pattern(10 * BSU, 1);
    let mut image = SparseImage::new(BS, 10 * 4096).unwrap();
    image.add_data(data.clone(), 0).unwrap();

    let max_len = 56 + 12 + 3 * 4096 + 100;
    let mut pieces = image.resparse(max_len).unwrap();
    assert_eq!(pieces.len(), 4);
    assert!(image.regions().is_empty());

    for piece in pieces.iter_mut() {
        assert_eq!(piece.len(), 10 * 4096);
        assert!(piece.output_len(WriteOptions::sparse_with_checksum()).unwrap() <= max_len);
    }

    let starts: Vec<u32> = pieces
        .iter()
        .map(|p| p.regions().get(0).unwrap().start_block())
        .collect();
    assert_eq!(starts, vec![0, 3, 6, 9]);

    assert_eq!(merge_pieces(&mut pieces), data);
}

#[test]
fn test_resparse_multiple_regions() {
    let mut image = SparseImage::new(BS, 32 * 4096).unwrap();
    image.add_data(pattern(2 * BSU, 4), 0).unwrap();
    image.add_fill(0x01010101, 6 * 4096, 4).unwrap();
    image.add_data(pattern(5 * BSU, 5), 12).unwrap();
    image.add_data(pattern(BSU, 6), 20).unwrap();
    image.add_fill(0x80808080, 4096, 30).unwrap();
    let expected = encode(&mut image, WriteOptions::raw());

    let max_len = 4 * 4096;
    let mut pieces = image.resparse(max_len).unwrap();
    assert!(pieces.len() > 1);

    for piece in pieces.iter_mut() {
        assert!(!piece.regions().is_empty());
        let len = piece.output_len(WriteOptions::sparse_with_checksum()).unwrap();
        assert!(len <= max_len, "piece of {} bytes", len);

        let bytes = encode(piece, WriteOptions::sparse_with_checksum());
        assert_eq!(bytes.len() as u64, len);
        let decoded = SparseImage::import_buf(bytes, true, &Silent).unwrap();
        assert_eq!(decoded.len(), 32 * 4096);
    }

    assert_eq!(merge_pieces(&mut pieces), expected);
}

#[test]
fn test_resparse_fits_in_one_piece() {
    let mut image = SparseImage::new(BS, 8 * 4096).unwrap();
    image.add_fill(0x22222222, 2 * 4096, 1).unwrap();
    image.add_data(pattern(BSU, 8), 5).unwrap();

    let pieces = image.resparse(1024 * 1024).unwrap();
    assert_eq!(pieces.len(), 1);
    assert_eq!(pieces[0].regions().len(), 2);
}

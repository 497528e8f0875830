//! simgtool CLI - Convert between Android sparse images and raw images.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use simgtool_core::{
    probe, Backing, OutputTarget, ReadMode, Source, SparseImage, TracingDiagnostics,
    WriteOptions, WriteProgress, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
use tempfile::NamedTempFile;
use tracing_subscriber::EnvFilter;

/// Tool for converting between Android sparse images and raw images.
#[derive(Parser)]
#[command(name = "simgtool")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Suppress progress output.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand sparse images onto a raw image.
    Simg2img {
        /// Sparse images to expand, in order, followed by the raw output.
        /// A sparse input of `-` reads standard input.
        #[arg(required = true, num_args = 2.., value_name = "SPARSE... RAW")]
        paths: Vec<PathBuf>,
    },

    /// Convert a raw image to a sparse image.
    #[command(alias = "img2img")]
    Img2simg {
        /// Detect holes through the filesystem instead of scanning blocks.
        #[arg(short = 's', long = "hole")]
        hole: bool,

        /// Raw input image (`-` for standard input).
        input: PathBuf,

        /// Sparse output image (`-` for standard output).
        output: PathBuf,

        /// Block size of the sparse image.
        #[arg(default_value_t = DEFAULT_BLOCK_SIZE, value_parser = parse_block_size)]
        block_size: u32,
    },

    /// Append a raw image to the end of a sparse image.
    Append2simg {
        /// Sparse image to extend in place.
        output: PathBuf,

        /// Raw image to append. Its size must be a multiple of the block size.
        input: PathBuf,
    },

    /// Split a sparse image into pieces no larger than a given size.
    Simg2simg {
        /// Sparse input image.
        input: PathBuf,

        /// Output prefix. Pieces are written to <PREFIX>.0, <PREFIX>.1, ...
        prefix: PathBuf,

        /// Maximum size of each piece in bytes.
        max_size: u64,
    },

    /// Display information about a sparse image.
    Info {
        /// Sparse image to inspect.
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Simg2img { paths } => run_simg2img(&paths, cli.quiet)?,
        Commands::Img2simg {
            hole,
            input,
            output,
            block_size,
        } => run_img2simg(&input, &output, block_size, hole, cli.quiet)?,
        Commands::Append2simg { output, input } => run_append2simg(&output, &input, cli.quiet)?,
        Commands::Simg2simg {
            input,
            prefix,
            max_size,
        } => run_simg2simg(&input, &prefix, max_size, cli.quiet)?,
        Commands::Info { input } => show_info(&input)?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn parse_block_size(arg: &str) -> std::result::Result<u32, String> {
    let size: u32 = arg
        .parse()
        .map_err(|_| format!("'{}' is not a block size", arg))?;
    if size < MIN_BLOCK_SIZE || size % 4 != 0 {
        return Err(format!(
            "block size must be at least {} and a multiple of 4",
            MIN_BLOCK_SIZE
        ));
    }
    Ok(size)
}

fn is_stdio(path: &Path) -> bool {
    path.as_os_str() == "-"
}

fn run_simg2img(paths: &[PathBuf], quiet: bool) -> Result<()> {
    let (output_path, inputs) = paths
        .split_last()
        .context("Expected at least one sparse input and a raw output")?;

    let mut output = File::create(output_path)
        .with_context(|| format!("Cannot open output file {}", output_path.display()))?;

    for (i, input) in inputs.iter().enumerate() {
        let stdin_source;
        let image = if is_stdio(input) {
            stdin_source = Source::sequential(io::stdin());
            SparseImage::import(&stdin_source, false, &TracingDiagnostics)
        } else {
            SparseImage::import_mapped(input, false, &TracingDiagnostics)
        };
        let mut image =
            image.with_context(|| format!("Failed to read sparse file {}", input.display()))?;

        output
            .seek(SeekFrom::Start(0))
            .context("Cannot rewind output file")?;

        let bar = progress_bar(quiet, &format!("simg2img {}/{}", i + 1, inputs.len()))?;
        write_image(
            &mut image,
            OutputTarget::Seekable(&mut output),
            WriteOptions::raw(),
            bar.as_ref(),
        )
        .context("Cannot write output file")?;
    }

    Ok(())
}

fn run_img2simg(input: &Path, output: &Path, block_size: u32, hole: bool, quiet: bool) -> Result<()> {
    let source = if is_stdio(input) {
        Source::sequential(io::stdin())
    } else {
        Source::open(input)
            .with_context(|| format!("Cannot open input file {}", input.display()))?
    };

    let len = source.len().context("Cannot seek input file")?;
    let mut image = SparseImage::new(block_size, len)?;
    let mode = if hole { ReadMode::Hole } else { ReadMode::Raw };
    image
        .read(&source, mode, false, &TracingDiagnostics)
        .context("Failed to read file")?;

    let bar = progress_bar(quiet, "img2simg")?;
    let written = if is_stdio(output) {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        write_image(
            &mut image,
            OutputTarget::Stream(&mut lock),
            WriteOptions::sparse(),
            bar.as_ref(),
        )
    } else {
        let mut file = File::create(output)
            .with_context(|| format!("Cannot open output file {}", output.display()))?;
        write_image(
            &mut image,
            OutputTarget::Seekable(&mut file),
            WriteOptions::sparse(),
            bar.as_ref(),
        )
    };
    written.context("Failed to write sparse file")?;

    Ok(())
}

fn run_append2simg(output: &Path, input: &Path, quiet: bool) -> Result<()> {
    let source = Source::open(output)
        .with_context(|| format!("Couldn't open output file {}", output.display()))?;
    let mut image = SparseImage::import_auto(&source, false, &TracingDiagnostics)
        .context("Couldn't import output file")?;

    image
        .append_file(input)
        .with_context(|| format!("Couldn't add input file {}", input.display()))?;

    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).context("Couldn't open temporary file")?;
    tracing::debug!(path = %tmp.path().display(), len = image.len(), "writing appended image");

    let bar = progress_bar(quiet, "append2simg")?;
    write_image(
        &mut image,
        OutputTarget::Seekable(tmp.as_file_mut()),
        WriteOptions::sparse(),
        bar.as_ref(),
    )
    .context("Failed to write sparse file")?;

    // The image re-reads the original through `source` until here.
    drop(image);
    drop(source);

    tmp.persist(output)
        .with_context(|| format!("Couldn't replace output file {}", output.display()))?;

    Ok(())
}

fn run_simg2simg(input: &Path, prefix: &Path, max_size: u64, quiet: bool) -> Result<()> {
    let mut image = SparseImage::import_mapped(input, false, &TracingDiagnostics)
        .with_context(|| format!("Failed to read sparse file {}", input.display()))?;

    let mut pieces = image
        .resparse(max_size)
        .context("Failed to resparse")?;
    tracing::debug!(pieces = pieces.len(), max_size, "writing resparsed pieces");

    for (i, piece) in pieces.iter_mut().enumerate() {
        let mut name = OsString::from(prefix.as_os_str());
        name.push(format!(".{}", i));
        let path = PathBuf::from(name);

        let mut file = File::create(&path)
            .with_context(|| format!("Cannot open output file {}", path.display()))?;
        piece
            .write(
                OutputTarget::Seekable(&mut file),
                WriteOptions::sparse_with_checksum(),
                None,
            )
            .with_context(|| format!("Cannot write output file {}", path.display()))?;

        if !quiet {
            let size = file.metadata().map(|m| m.len()).unwrap_or(0);
            println!("{}: {}", path.display(), format_bytes(size));
        }
    }

    Ok(())
}

fn show_info(input: &Path) -> Result<()> {
    let source = Source::open(input)
        .with_context(|| format!("Cannot open input file {}", input.display()))?;
    let header = probe(&source)
        .with_context(|| format!("{} is not a sparse image", input.display()))?;
    drop(source);

    let mut image = SparseImage::import_mapped(input, true, &TracingDiagnostics)
        .with_context(|| format!("Failed to read sparse file {}", input.display()))?;

    println!("Sparse Image Information");
    println!("========================");
    println!();
    println!("Version:      {}.{}", header.major_version, header.minor_version);
    println!("Block size:   {}", header.block_size);
    println!("Blocks:       {}", header.total_blocks);
    println!("Chunks:       {}", header.total_chunks);
    println!("Raw size:     {}", format_bytes(header.logical_len()));
    println!(
        "Sparse size:  {}",
        format_bytes(image.output_len(WriteOptions::sparse())?)
    );
    println!();

    let block_size = image.block_size();
    if image.regions().is_empty() {
        println!("Regions:      None");
    } else {
        println!("Regions:");
        for (i, region) in image.regions().iter().enumerate() {
            let detail = match region.backing() {
                Backing::Fill(value) => format!("fill 0x{:08x}", value),
                other => other.name().to_string(),
            };
            println!(
                "  {}. blocks {}-{} - {} ({})",
                i + 1,
                region.start_block(),
                region.end_block(block_size).saturating_sub(1),
                format_bytes(region.len()),
                detail
            );
        }
    }

    Ok(())
}

fn progress_bar(quiet: bool, label: &str) -> Result<Option<ProgressBar>> {
    if quiet {
        return Ok(None);
    }

    let pb = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template("{msg} {spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(label.to_string());
    Ok(Some(pb))
}

fn write_image(
    image: &mut SparseImage<'_>,
    target: OutputTarget<'_>,
    options: WriteOptions,
    bar: Option<&ProgressBar>,
) -> simgtool_core::Result<()> {
    let Some(pb) = bar else {
        return image.write(target, options, None);
    };

    let report: &mut dyn FnMut(WriteProgress) = &mut |progress| {
        pb.set_length(progress.bytes_total);
        pb.set_position(progress.bytes_processed);
    };
    let result = image.write(target, options, Some(report));

    if result.is_ok() {
        pb.finish();
    } else {
        pb.abandon();
    }
    result
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_block_size() {
        assert_eq!(parse_block_size("4096"), Ok(4096));
        assert_eq!(parse_block_size("1024"), Ok(1024));
        assert!(parse_block_size("1020").is_err());
        assert!(parse_block_size("1026").is_err());
        assert!(parse_block_size("abc").is_err());
    }

    #[test]
    fn test_simg2img_paths_split() {
        let cli = Cli::parse_from(["simgtool", "simg2img", "a.simg", "b.simg", "out.img"]);
        match cli.command {
            Commands::Simg2img { paths } => {
                let (output, inputs) = paths.split_last().unwrap();
                assert_eq!(output, Path::new("out.img"));
                assert_eq!(inputs.len(), 2);
            }
            _ => panic!("expected simg2img"),
        }
    }

    #[test]
    fn test_img2img_alias_and_hole_flag() {
        let cli = Cli::parse_from(["simgtool", "img2img", "-s", "in.img", "out.simg", "8192"]);
        match cli.command {
            Commands::Img2simg {
                hole, block_size, ..
            } => {
                assert!(hole);
                assert_eq!(block_size, 8192);
            }
            _ => panic!("expected img2simg"),
        }
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }
}

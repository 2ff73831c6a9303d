//! Try-on vision CLI tool
//!
//! Command-line interface over [`VisionProcessor`]: optimize uploads, remove
//! backgrounds and check that both feet are visible.

use crate::{
    config::VisionConfig,
    models::ModelSource,
    processor::{VisionProcessor, VisionProcessorBuilder},
    services::ImageIOService,
    tracing_config::{events, init_cli_tracing, spans},
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Image analysis for virtual try-on
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "tryon-vision")]
pub struct Cli {
    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// JSON pipeline configuration; missing fields use defaults
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Hide the progress bar while model files download
    #[arg(long, global = true)]
    pub no_progress: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Crop photos to the person and shrink them to the size limits
    Optimize(OptimizeArgs),
    /// Write a PNG with the background made transparent
    RemoveBackground(RemoveBackgroundArgs),
    /// Check that both feet are visible in a photo
    ValidateFeet(ValidateFeetArgs),
}

#[derive(Args, Debug)]
pub struct OptimizeArgs {
    /// Input images or directories
    #[arg(value_name = "INPUT", required = true)]
    pub input: Vec<PathBuf>,

    /// Output directory [default: next to each input]
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    #[arg(long)]
    pub max_width: Option<u32>,

    #[arg(long)]
    pub max_height: Option<u32>,

    /// Process directories recursively
    #[arg(short, long)]
    pub recursive: bool,

    #[command(flatten)]
    pub segmentation: SegmentationArgs,
}

#[derive(Args, Debug)]
pub struct RemoveBackgroundArgs {
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Output PNG file
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    #[command(flatten)]
    pub segmentation: SegmentationArgs,
}

#[derive(Args, Debug)]
pub struct ValidateFeetArgs {
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Pose model path or URL
    #[arg(long, value_name = "SOURCE")]
    pub pose_model: String,

    /// Side of the square pose model input
    #[arg(long, default_value_t = 192)]
    pub pose_input_size: u32,

    #[arg(long, value_enum, default_value_t = CliPoseInput::Int32)]
    pub pose_input_type: CliPoseInput,

    /// Ambiguous attempts to run before giving up
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Print the verdict as JSON
    #[arg(long)]
    pub json: bool,
}

/// Segmentation model options shared by the image commands
#[derive(Args, Debug)]
pub struct SegmentationArgs {
    /// Segmentation model path or URL; chroma key is used without one
    #[arg(long, value_name = "SOURCE")]
    pub segmentation_model: Option<String>,

    /// Square input size of the segmentation model
    #[arg(long, default_value_t = 256)]
    pub segmentation_size: u32,

    #[arg(long, value_enum, default_value_t = CliLayout::Nhwc)]
    pub segmentation_layout: CliLayout,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CliLayout {
    Nchw,
    Nhwc,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CliPoseInput {
    Int32,
    Float32,
}

/// Main entry point for the CLI
pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_cli_tracing(cli.verbose).context("Failed to initialize tracing")?;

    let config = match &cli.config {
        Some(path) => VisionConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => VisionConfig::default(),
    };
    debug!(?config, "Loaded configuration");

    let show_download = download_progress(cli.no_progress, std::io::stderr().is_terminal());
    let session_id = uuid::Uuid::new_v4().to_string();
    match cli.command {
        Command::Optimize(args) => {
            optimize_command(config, args, show_download)
                .instrument(spans::session(&session_id, "optimize"))
                .await
        },
        Command::RemoveBackground(args) => {
            remove_background_command(config, args, show_download)
                .instrument(spans::session(&session_id, "remove-background"))
                .await
        },
        Command::ValidateFeet(args) => {
            validate_feet_command(config, args, show_download)
                .instrument(spans::session(&session_id, "validate-feet"))
                .await
        },
    }
}

async fn optimize_command(
    mut config: VisionConfig,
    args: OptimizeArgs,
    show_download: bool,
) -> Result<()> {
    if let Some(max_width) = args.max_width {
        config.resize.max_width = max_width;
    }
    if let Some(max_height) = args.max_height {
        config.resize.max_height = max_height;
    }

    let files = collect_inputs(&args.input, args.recursive)?;
    if files.is_empty() {
        warn!("No supported image files found in the provided inputs");
        return Ok(());
    }
    info!("Found {} image file(s) to process", files.len());

    if let Some(dir) = &args.output {
        prepare_output_dir(dir)?;
    }

    let builder = VisionProcessor::builder().config(config);
    let processor = with_segmentation(builder, &args.segmentation, show_download)?
        .build()
        .context("Failed to create processor")?;

    let progress = (files.len() > 1).then(|| {
        let bar = ProgressBar::new(files.len() as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar
    });

    let start = Instant::now();
    let failed = process_batch(&processor, &files, args.output.as_deref(), progress.as_ref())
        .instrument(spans::batch_processing(files.len()))
        .await?;

    if let Some(bar) = progress {
        bar.finish_with_message("done");
    }

    events::progress(&format!(
        "Processed {}/{} file(s) in {:.2}s",
        files.len() - failed,
        files.len(),
        start.elapsed().as_secs_f64()
    ));

    if failed > 0 {
        anyhow::bail!("{failed} file(s) failed to process");
    }
    Ok(())
}

/// Optimize every file, returning how many failed
async fn process_batch(
    processor: &VisionProcessor,
    files: &[PathBuf],
    output_dir: Option<&Path>,
    progress: Option<&ProgressBar>,
) -> Result<usize> {
    let mut failed = 0usize;

    for file in files {
        if let Some(bar) = progress {
            bar.set_message(file.file_name().unwrap_or_default().to_string_lossy().into_owned());
        }

        let output_path = optimized_output_path(file, output_dir);
        match processor
            .optimize_file(file)
            .instrument(spans::file_processing(file))
            .await
        {
            Ok(optimized) => {
                optimized
                    .save(&output_path)
                    .with_context(|| format!("Failed to write {}", output_path.display()))?;
                info!(
                    "{} -> {} ({}x{} -> {}x{}, ratio {:.2})",
                    file.display(),
                    output_path.display(),
                    optimized.original_width,
                    optimized.original_height,
                    optimized.optimized_width,
                    optimized.optimized_height,
                    optimized.compression_ratio
                );
            },
            Err(e) => {
                failed += 1;
                events::error_with_context(&e, &file.display().to_string());
            },
        }

        if let Some(bar) = progress {
            bar.inc(1);
        }
    }

    Ok(failed)
}

async fn remove_background_command(
    config: VisionConfig,
    args: RemoveBackgroundArgs,
    show_download: bool,
) -> Result<()> {
    let builder = VisionProcessor::builder().config(config);
    let processor = with_segmentation(builder, &args.segmentation, show_download)?
        .build()
        .context("Failed to create processor")?;

    let bytes = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let removed = processor.remove_background(&bytes).await?;
    info!(method = %removed.method, "Background removed");

    let png = removed.to_png()?;
    tokio::fs::write(&args.output, png)
        .await
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    println!("{}", args.output.display());
    Ok(())
}

async fn validate_feet_command(
    mut config: VisionConfig,
    args: ValidateFeetArgs,
    show_download: bool,
) -> Result<()> {
    if let Some(max_retries) = args.max_retries {
        config.feet.max_retries = max_retries;
    }

    let source: ModelSource = args.pose_model.parse().context("Invalid pose model source")?;
    let builder = VisionProcessor::builder().config(config);
    let processor = with_pose(builder, source, &args, show_download)?
        .build()
        .context("Failed to create processor")?;

    let bytes = tokio::fs::read(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let verdict = processor.validate_feet(&bytes).await?;
    processor.cleanup();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        println!("{}: {}", args.input.display(), verdict.summary());
    }
    Ok(())
}

#[cfg(feature = "tract")]
fn with_segmentation(
    builder: VisionProcessorBuilder,
    args: &SegmentationArgs,
    show_download: bool,
) -> Result<VisionProcessorBuilder> {
    use crate::backends::{SegmentationModelConfig, TensorLayout, TractSegmentationBackend};

    let Some(model) = &args.segmentation_model else {
        info!("No segmentation model given, using chroma key");
        return Ok(builder);
    };
    let source: ModelSource = model.parse().context("Invalid segmentation model source")?;
    let model_config = SegmentationModelConfig {
        input_width: args.segmentation_size,
        input_height: args.segmentation_size,
        layout: match args.segmentation_layout {
            CliLayout::Nchw => TensorLayout::Nchw,
            CliLayout::Nhwc => TensorLayout::Nhwc,
        },
        ..SegmentationModelConfig::default()
    };
    let backend = TractSegmentationBackend::new(source, model_config).with_download_progress(show_download);
    Ok(builder.segmentation_backend(std::sync::Arc::new(backend)))
}

#[cfg(not(feature = "tract"))]
fn with_segmentation(
    builder: VisionProcessorBuilder,
    args: &SegmentationArgs,
    _show_download: bool,
) -> Result<VisionProcessorBuilder> {
    if args.segmentation_model.is_some() {
        anyhow::bail!("Segmentation models need the 'tract' feature");
    }
    Ok(builder)
}

#[cfg(feature = "tract")]
fn with_pose(
    builder: VisionProcessorBuilder,
    source: ModelSource,
    args: &ValidateFeetArgs,
    show_download: bool,
) -> Result<VisionProcessorBuilder> {
    use crate::backends::{PoseInputType, PoseModelConfig, TractPoseBackend};

    let model_config = PoseModelConfig {
        input_size: args.pose_input_size,
        input_type: match args.pose_input_type {
            CliPoseInput::Int32 => PoseInputType::Int32,
            CliPoseInput::Float32 => PoseInputType::Float32,
        },
    };
    let backend = TractPoseBackend::new(source, model_config).with_download_progress(show_download);
    Ok(builder.pose_backend(std::sync::Arc::new(backend)))
}

#[cfg(not(feature = "tract"))]
fn with_pose(
    _builder: VisionProcessorBuilder,
    _source: ModelSource,
    _args: &ValidateFeetArgs,
    _show_download: bool,
) -> Result<VisionProcessorBuilder> {
    anyhow::bail!("Pose models need the 'tract' feature")
}

/// Progress bars only make sense on an interactive stderr
fn download_progress(no_progress: bool, interactive: bool) -> bool {
    interactive && !no_progress
}

/// Expand files and directories into a sorted list of image files
fn collect_inputs(inputs: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            files.extend(find_image_files(input, recursive)?);
        } else if input.is_file() {
            if is_image_file(input) {
                files.push(input.clone());
            } else {
                warn!("Skipping unsupported file: {}", input.display());
            }
        } else {
            anyhow::bail!("Input not found: {}", input.display());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn find_image_files(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    if recursive {
        for entry in walkdir::WalkDir::new(dir) {
            let entry = entry?;
            if entry.file_type().is_file() && is_image_file(entry.path()) {
                files.push(entry.path().to_path_buf());
            }
        }
    } else {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() && is_image_file(&entry.path()) {
                files.push(entry.path());
            }
        }
    }

    Ok(files)
}

fn is_image_file(path: &Path) -> bool {
    ImageIOService::is_supported_format(path)
}

fn prepare_output_dir(dir: &Path) -> Result<()> {
    if dir.is_file() {
        anyhow::bail!(
            "Output path exists and is a file, not a directory: {}",
            dir.display()
        );
    }
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))
}

/// `<stem>_optimized.png`, in `output_dir` or next to the input
fn optimized_output_path(input: &Path, output_dir: Option<&Path>) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let dir = output_dir.unwrap_or_else(|| input.parent().unwrap_or(Path::new(".")));
    dir.join(format!("{stem}_optimized.png"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_optimize() {
        let cli = Cli::try_parse_from([
            "tryon-vision",
            "-vv",
            "optimize",
            "a.jpg",
            "b.png",
            "-o",
            "out",
            "--max-width",
            "512",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Optimize(args) = cli.command else {
            panic!("expected optimize");
        };
        assert_eq!(args.input.len(), 2);
        assert_eq!(args.output, Some(PathBuf::from("out")));
        assert_eq!(args.max_width, Some(512));
        assert_eq!(args.max_height, None);
        assert!(args.segmentation.segmentation_model.is_none());
        assert_eq!(args.segmentation.segmentation_layout, CliLayout::Nhwc);
    }

    #[test]
    fn test_validate_feet_requires_pose_model() {
        assert!(Cli::try_parse_from(["tryon-vision", "validate-feet", "photo.jpg"]).is_err());

        let cli = Cli::try_parse_from([
            "tryon-vision",
            "validate-feet",
            "photo.jpg",
            "--pose-model",
            "movenet.onnx",
            "--json",
        ])
        .unwrap();
        let Command::ValidateFeet(args) = cli.command else {
            panic!("expected validate-feet");
        };
        assert!(args.json);
        assert_eq!(args.pose_input_size, 192);
        assert_eq!(args.pose_input_type, CliPoseInput::Int32);
    }

    #[test]
    fn test_download_progress_flag() {
        let cli = Cli::try_parse_from(["tryon-vision", "optimize", "a.jpg", "--no-progress"]).unwrap();
        assert!(cli.no_progress);
        assert!(!download_progress(cli.no_progress, true));
        assert!(download_progress(false, true));
        assert!(!download_progress(false, false));
    }

    #[test]
    fn test_optimized_output_path() {
        assert_eq!(
            optimized_output_path(Path::new("/photos/me.jpg"), None),
            PathBuf::from("/photos/me_optimized.png")
        );
        assert_eq!(
            optimized_output_path(Path::new("/photos/me.jpg"), Some(Path::new("/out"))),
            PathBuf::from("/out/me_optimized.png")
        );
        assert_eq!(
            optimized_output_path(Path::new("me.webp"), None),
            PathBuf::from("me_optimized.png")
        );
    }

    #[test]
    fn test_is_image_file() {
        assert!(is_image_file(Path::new("a.JPG")));
        assert!(is_image_file(Path::new("a.webp")));
        assert!(!is_image_file(Path::new("a.gif")));
        assert!(!is_image_file(Path::new("noext")));
    }

    #[test]
    fn test_find_image_files_recursive_and_sorted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.png"), b"").unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("c.webp"), b"").unwrap();

        let flat = collect_inputs(&[dir.path().to_path_buf()], false).unwrap();
        assert_eq!(flat, vec![dir.path().join("a.jpg"), dir.path().join("b.png")]);

        let deep = collect_inputs(&[dir.path().to_path_buf()], true).unwrap();
        assert_eq!(deep.len(), 3);
        assert!(deep.contains(&dir.path().join("nested").join("c.webp")));
    }

    #[test]
    fn test_missing_input_is_error() {
        let dir = TempDir::new().unwrap();
        assert!(collect_inputs(&[dir.path().join("missing.jpg")], false).is_err());
    }

    #[test]
    fn test_prepare_output_dir() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        prepare_output_dir(&out).unwrap();
        assert!(out.is_dir());

        let file = dir.path().join("file.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(prepare_output_dir(&file).is_err());
    }
}

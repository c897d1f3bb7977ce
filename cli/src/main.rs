use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use peoplespot_core::{
    detection::{YoloDetector, YoloParams},
    pipeline::{DEFAULT_CONFIDENCE, EncodeMode, annotate_video, validate_threshold},
    runtime::configure_ort_dylib,
    session::OutputDir,
    video::{probe, total_frames},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "peoplespot",
    version,
    about = "Detect people in a video and burn labelled boxes into a copy of it",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect people in every frame and write an annotated H.264 video.
    Annotate {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,

        /// Output video path [default: ./preds_<uuid>.mp4]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// YOLO ONNX model path
        #[arg(long, default_value = "yolo12n.onnx")]
        model: PathBuf,

        /// Minimum detection confidence (0–1)
        #[arg(long, default_value_t = DEFAULT_CONFIDENCE)]
        conf: f32,

        /// Encode frames as they are annotated instead of buffering the whole video
        #[arg(long)]
        streaming: bool,
    },

    /// Print stream properties of a video.
    Probe {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Annotate {
            input,
            output,
            model,
            conf,
            streaming,
        } => cmd_annotate(input, output, model, conf, streaming),
        Commands::Probe { input } => cmd_probe(&input),
    }
}

// ── annotate ──────────────────────────────────────────────────────────────────

fn cmd_annotate(
    input: PathBuf,
    output: Option<PathBuf>,
    model: PathBuf,
    conf: f32,
    streaming: bool,
) -> Result<()> {
    let threshold = validate_threshold(conf)?;
    let output = match output {
        Some(path) => path,
        None => OutputDir::new(".")?.next_path(),
    };
    let mode = if streaming {
        EncodeMode::Streaming
    } else {
        EncodeMode::Buffered
    };

    info!("Annotating people");
    info!("  input     : {}", input.display());
    info!("  output    : {}", output.display());
    info!("  model     : {}", model.display());
    info!("  threshold : {threshold}");

    configure_ort_dylib();
    let mut detector = YoloDetector::load(&model, YoloParams::default())
        .with_context(|| format!("failed to load model: {}", model.display()))?;

    let pb = progress_bar(total_frames(&input));
    let summary = annotate_video(
        &input,
        &output,
        &mut detector,
        threshold,
        mode,
        &mut |path: &Path| info!("writing {}", path.display()),
        &mut |done, _| pb.set_position(done),
    )
    .context("annotation failed")?;

    let Some(summary) = summary else {
        pb.abandon_with_message("No frames decoded.");
        bail!("no frames decoded from {}", input.display());
    };

    pb.finish_with_message("Done.");
    println!(
        "{} ({} frames, {} detections, {:.2} fps)",
        output.display(),
        summary.frames,
        summary.detections,
        summary.fps()
    );
    Ok(())
}

// ── probe ─────────────────────────────────────────────────────────────────────

fn cmd_probe(input: &Path) -> Result<()> {
    let info = probe(input).with_context(|| format!("failed to probe {}", input.display()))?;
    println!("file       : {}", input.display());
    println!("codec      : {:?}", info.codec);
    println!("size       : {}x{}", info.width, info.height);
    println!(
        "frame rate : {}/{} ({:.3} fps)",
        info.frame_rate.numerator(),
        info.frame_rate.denominator(),
        info.fps()
    );
    println!("frames     : {}", info.frame_count_hint);
    println!("audio      : {}", if info.has_audio { "yes" } else { "no" });
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Bar when the frame count is known, spinner otherwise.
fn progress_bar(total: u64) -> ProgressBar {
    let pb = if total > 0 {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} frames ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        pb
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {pos} frames [{elapsed_precise}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        pb
    };
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn annotate_defaults() {
        let cli = Cli::try_parse_from(["peoplespot", "annotate", "-i", "in.mp4"]).unwrap();
        match cli.command {
            Commands::Annotate {
                input,
                output,
                model,
                conf,
                streaming,
            } => {
                assert_eq!(input, PathBuf::from("in.mp4"));
                assert_eq!(output, None);
                assert_eq!(model, PathBuf::from("yolo12n.onnx"));
                assert_eq!(conf, 0.45);
                assert!(!streaming);
            }
            Commands::Probe { .. } => panic!("expected annotate"),
        }
    }
}

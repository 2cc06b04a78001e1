//! Denoiser Player Example
//!
//! Plays a raw frame sequence through the denoise pipeline in a window, or runs
//! it headless for a fixed number of frames.
//!
//! # Usage
//! ```bash
//! cargo run --example player -- img --frame-delay 2
//! cargo run --example player -- img --headless 300
//! ```

mod app;

use crate::app::DenoiseApp;
use clap::Parser;
use denoise_wgpu::{FrameOutcome, HeadlessBackend, Pipeline, PipelineConfig, PipelineResult, RawSequenceLoader, config::DEFAULT_FRAME_DELAY};
use std::path::PathBuf;
use winit::event_loop::{ControlFlow, EventLoop};

/// Command-line arguments for the player
#[derive(Parser)]
#[command(version, about, long_about=None)]
struct Args {
    /// Directory holding the `*_0_NNNN.raw` sequence
    #[arg(default_value = "img")]
    sequence_dir: PathBuf,

    /// Directory with WGSL files overriding the built-in shaders
    #[arg(long)]
    shader_dir: Option<PathBuf>,

    /// Displayed frames per input frame
    #[arg(long, default_value_t = DEFAULT_FRAME_DELAY)]
    frame_delay: u32,

    /// Run this many frames against the recording backend instead of opening a window
    #[arg(long, value_name = "FRAMES")]
    headless: Option<u32>,

    /// Maximum log level
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

/// Runs `frames` iterations without a device and reports what was recorded
fn run_headless(config: &PipelineConfig, frames: u32) -> PipelineResult<()> {
    let loader = RawSequenceLoader::new(&config.sequence_dir);
    let mut pipeline = Pipeline::new(HeadlessBackend::new(), loader, config.frame_delay)?;

    let mut uploads = 0;
    let mut skipped = 0;
    for _ in 0..frames {
        match pipeline.render_frame()? {
            FrameOutcome::Presented { frame_index: Some(_) } => uploads += 1,
            FrameOutcome::Presented { frame_index: None } => {}
            FrameOutcome::Skipped => skipped += 1,
        }
    }

    let backend = pipeline.backend();
    tracing::info!(
        frames,
        uploads,
        skipped,
        submissions = backend.submission_count(),
        barriers = backend.barrier_count(),
        layer_copies = backend.upload_count(),
        bytes_written = backend.bytes_written(),
        "headless run finished"
    );

    pipeline.shutdown()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt().with_max_level(args.log_level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = PipelineConfig {
        sequence_dir: args.sequence_dir,
        shader_dir: args.shader_dir,
        frame_delay: args.frame_delay,
    };
    tracing::info!(?config, "starting denoise player");

    if let Some(frames) = args.headless {
        run_headless(&config, frames)?;
        return Ok(());
    }

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = DenoiseApp::new(config);
    event_loop.run_app(&mut app)?;

    match app.into_error() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

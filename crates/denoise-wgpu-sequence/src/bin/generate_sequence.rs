//! Writes a synthetic raw sequence the player can consume
//!
//! # Usage
//! ```bash
//! cargo run --bin generate_sequence -- --out img sphere
//! cargo run --bin generate_sequence -- --frames 60 pan --image photo.png
//! ```

use clap::{Parser, Subcommand};
use denoise_wgpu::config::{HEIGHT, SEQUENCE_LENGTH, WIDTH};
use denoise_wgpu_sequence::{
    SequenceResult, generate_sequence,
    scenes::{Gradient, Pan, Sphere},
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(version, about, long_about=None)]
struct Args {
    /// Output directory, created if missing
    #[arg(long, default_value = "img")]
    out: PathBuf,

    #[arg(long, default_value_t = SEQUENCE_LENGTH)]
    frames: u32,

    #[arg(long, default_value_t = WIDTH)]
    width: u32,

    #[arg(long, default_value_t = HEIGHT)]
    height: u32,

    /// Maximum log level
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    scene: SceneArg,
}

#[derive(Subcommand)]
enum SceneArg {
    /// Scrolling gradient over a flat far plane
    Gradient,
    /// Sphere circling in front of a checkerboard
    Sphere,
    /// Horizontal pan across an image
    Pan {
        #[arg(long)]
        image: PathBuf,
    },
}

fn main() -> SequenceResult<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_max_level(args.log_level).init();

    let written = match &args.scene {
        SceneArg::Gradient => generate_sequence(&Gradient, &args.out, args.frames, args.width, args.height)?,
        SceneArg::Sphere => generate_sequence(&Sphere::default(), &args.out, args.frames, args.width, args.height)?,
        SceneArg::Pan { image } => generate_sequence(&Pan::open(image)?, &args.out, args.frames, args.width, args.height)?,
    };

    tracing::info!(frames = written, out = %args.out.display(), "sequence written");
    Ok(())
}

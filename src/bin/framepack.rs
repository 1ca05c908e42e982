//! FramePack planning and latent utilities
//!
//! # Usage
//!
//! ```bash
//! # Section plan and index partitions for a 5 second clip
//! cargo run --release --bin framepack -- plan --total-seconds 5 --window-size 9
//!
//! # Nearest training bucket for a 1280x720 input
//! cargo run --release --bin framepack -- bucket --width 1280 --height 720
//!
//! # Trim decoded loop frames
//! cargo run --release --bin framepack -- trim --input frames.bin --output loop.bin --window-size 9
//! ```

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use candle_framepack::{
    bucket::find_nearest_bucket,
    config::RunConfig,
    finalize::{LoopTrim, split_loop_frames},
    indices::{IndexPartition, PartitionMode, connective_clean_4x_len},
    latents_bin::{read_f32_tensor, write_f32_tensor},
    loader::{DEFAULT_REPO_ID, detect_weight_precision, download_transformer, resolve_checkpoint_files},
    planner::{Section, connection_latent_sections, plan_sections, total_latent_sections},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "FramePack section planning and latent utilities")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the section plan and index partitions as JSON
    Plan {
        /// Run configuration JSON; flags below override its fields
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        total_seconds: Option<f64>,

        #[arg(long)]
        window_size: Option<usize>,

        /// Latent frames of the start image
        #[arg(long, default_value = "1")]
        start_frames: usize,

        /// Plan the loop sampler's main and connective passes
        #[arg(long = "loop")]
        looped: bool,
    },

    /// Find the nearest resolution bucket
    Bucket {
        #[arg(long)]
        width: usize,

        #[arg(long)]
        height: usize,

        #[arg(long, default_value = "640")]
        base_resolution: usize,
    },

    /// Drop leading and trailing frames (dim 0) of a tensor file
    Trim {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Derive the loop trim from a latent window size
        #[arg(long, conflicts_with_all = ["start_frames", "end_frames"])]
        window_size: Option<usize>,

        #[arg(long, default_value = "0")]
        start_frames: usize,

        #[arg(long, default_value = "0")]
        end_frames: usize,
    },

    /// Report the files and weight precision of a transformer checkpoint
    Inspect {
        /// Checkpoint file or directory
        path: PathBuf,
    },

    /// Download the transformer from the hub
    Download {
        #[arg(long, default_value = DEFAULT_REPO_ID)]
        repo: String,
    },
}

#[derive(Serialize)]
struct PlannedSection {
    #[serde(flatten)]
    section: Section,
    partition: IndexPartition,
}

#[derive(Serialize)]
struct Plan {
    total_sections: usize,
    pixel_frames_per_section: usize,
    sections: Vec<PlannedSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection: Option<ConnectionPlan>,
}

#[derive(Serialize)]
struct ConnectionPlan {
    sections: Vec<PlannedSection>,
    trim: LoopTrim,
}

fn planned(sections: Vec<Section>, mode: impl Fn(&Section) -> PartitionMode) -> Vec<PlannedSection> {
    sections
        .into_iter()
        .map(|section| PlannedSection {
            partition: IndexPartition::build(section.padding, section.window_size, mode(&section)),
            section,
        })
        .collect()
}

fn plan(
    config: Option<PathBuf>,
    total_seconds: Option<f64>,
    window_size: Option<usize>,
    start_frames: usize,
    looped: bool,
) -> Result<Plan> {
    let mut run = match config {
        Some(path) => RunConfig::from_json_file(&path)
            .with_context(|| format!("Failed to load run config {}", path.display()))?,
        None => RunConfig::default(),
    };
    if let Some(seconds) = total_seconds {
        run = run.with_total_seconds(seconds);
    }
    if let Some(window) = window_size {
        run = run.with_window_size(window);
    }
    run.validate()?;

    let window = run.latent_window_size;
    let total = total_latent_sections(run.total_second_length, window);
    info!(total_sections = total, window_size = window, looped, "Planning sections");

    let pre_frames = start_frames;
    let (sections, connection) = if looped {
        let connection_sections = connection_latent_sections(run.connection_second_length);
        let clean_4x_len = connective_clean_4x_len(total + connection_sections);
        let main = planned(plan_sections(total, window), |_| PartitionMode::LoopMain { pre_frames });
        let connection = ConnectionPlan {
            sections: planned(plan_sections(connection_sections, window), |_| {
                PartitionMode::Connective { clean_4x_len }
            }),
            trim: LoopTrim::for_window(window),
        };
        (main, Some(connection))
    } else {
        let main = planned(plan_sections(total, window), |_| PartitionMode::Standard { pre_frames });
        (main, None)
    };

    Ok(Plan {
        total_sections: total,
        pixel_frames_per_section: run.pixel_frames_per_section(),
        sections,
        connection,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_framepack=info".parse()?)
                .add_directive("framepack=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Plan {
            config,
            total_seconds,
            window_size,
            start_frames,
            looped,
        } => {
            let plan = plan(config, total_seconds, window_size, start_frames, looped)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Command::Bucket {
            width,
            height,
            base_resolution,
        } => {
            let bucket = find_nearest_bucket(height, width, base_resolution);
            info!(width, height, bucket_width = bucket.width, bucket_height = bucket.height, "Nearest bucket");
            println!("{}", serde_json::to_string(&bucket)?);
        }
        Command::Trim {
            input,
            output,
            window_size,
            start_frames,
            end_frames,
        } => {
            let (start, end) = match window_size {
                Some(window) => {
                    let trim = LoopTrim::for_window(window);
                    (trim.start_frames, trim.end_frames)
                }
                None => (start_frames, end_frames),
            };
            let frames = read_f32_tensor(&input, &Device::Cpu)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let trimmed = split_loop_frames(&frames, start, end)?;
            write_f32_tensor(&output, &trimmed)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!(
                input_frames = frames.dims().first().copied().unwrap_or(0),
                output_frames = trimmed.dims().first().copied().unwrap_or(0),
                "Trimmed frames"
            );
        }
        Command::Inspect { path } => {
            let files = resolve_checkpoint_files(&path)?;
            let precision = detect_weight_precision(&files)?;
            for file in &files {
                println!("{}", file.display());
            }
            println!("weight precision: {}", precision.name());
        }
        Command::Download { repo } => {
            let dir = download_transformer(&repo)?;
            println!("{}", dir.display());
        }
    }

    Ok(())
}

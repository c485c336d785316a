//! CLI entry point for white matter bundle segmentation

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tractseg_core::cli::Cli;
use tractseg_core::pipeline;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -q / -v
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level())),
        )
        .with_writer(std::io::stderr)
        .init();

    let input = cli.input.clone();
    let config = cli.into_config().context("invalid arguments")?;
    let summary = pipeline::run(&config)
        .with_context(|| format!("segmentation of '{}' failed", input.display()))?;

    if let Some(axis) = summary.detected_flip {
        info!(%axis, "peaks were flipped during the orientation check");
    }
    for (stage, elapsed) in &summary.timings {
        info!(stage, seconds = elapsed.as_secs_f64(), "timing");
    }
    info!(
        files = summary.written.len(),
        tracks = summary.intermediate.tracks.len(),
        output = %config.output_dir.display(),
        "done"
    );
    Ok(())
}

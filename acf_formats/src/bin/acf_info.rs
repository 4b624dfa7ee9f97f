use std::collections::BTreeMap;
use std::path::PathBuf;

use acf_formats::{map_input, parse_acf};
use anyhow::Result;
use clap::Parser;
use serde::Serialize;

#[derive(Parser)]
#[command(about = "Inspect an ACF cutscene container", version)]
struct Args {
    /// Path to an .acf container to inspect.
    input: PathBuf,

    /// Emit the summary as JSON instead of plain text.
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    width: u32,
    height: u32,
    play_rate: u32,
    key_rate: u32,
    sampling_rate: u32,
    compressor: u32,
    frames: u32,
    degraded_frames: u32,
    failed_frames: u32,
    cameras: usize,
    end_seen: bool,
    chunks: BTreeMap<String, usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let bytes = map_input(&args.input)?;
    let summary = parse_acf(&bytes, |_| Ok(()))?;

    let Some(format) = summary.format else {
        println!("ACF {}: no format chunk found", args.input.display());
        return Ok(());
    };

    if args.json {
        let report = Report {
            width: format.width,
            height: format.height,
            play_rate: format.play_rate,
            key_rate: format.key_rate,
            sampling_rate: format.sampling_rate,
            compressor: format.compressor,
            frames: summary.frames,
            degraded_frames: summary.degraded_frames,
            failed_frames: summary.failed_frames,
            cameras: summary.cameras.len(),
            end_seen: summary.end_seen,
            chunks: summary.chunk_counts,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "ACF {}: {} frames, {}x{}, play_rate={} key_rate={} compressor={}",
        args.input.display(),
        summary.frames,
        format.width,
        format.height,
        format.play_rate,
        format.key_rate,
        format.compressor
    );
    println!(
        "Audio: {} Hz, sample_type={} flags=0x{:04x}",
        format.sampling_rate, format.sample_type, format.sample_flags
    );
    if let Some(frame_len) = &summary.frame_len {
        println!(
            "Frame lengths: biggest={} bytes, {} sector entries",
            frame_len.biggest_frame_size,
            frame_len.sectors.len()
        );
    }
    println!(
        "Cameras: {}, degraded frames: {}, failed frames: {}, end chunk: {}",
        summary.cameras.len(),
        summary.degraded_frames,
        summary.failed_frames,
        if summary.end_seen { "present" } else { "missing" }
    );
    let chunks: Vec<String> = summary
        .chunk_counts
        .iter()
        .map(|(tag, count)| format!("{tag}={count}"))
        .collect();
    println!("Chunks: {}", chunks.join(" "));

    Ok(())
}

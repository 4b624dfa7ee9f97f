use std::fs;
use std::path::{Path, PathBuf};

use acf_formats::{map_input, parse_acf, render_vue, save_pcx};
use anyhow::{Context, Result, bail};
use clap::Parser;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(about = "Extract ACF cutscene containers to PCX frames", version)]
struct Args {
    /// ACF container to extract (may be passed multiple times)
    #[arg(long = "acf", value_name = "PATH", conflicts_with = "root")]
    inputs: Vec<PathBuf>,

    /// Directory containing ACF containers (recursively scanned when --acf is not used)
    #[arg(long = "root", value_name = "DIR", conflicts_with = "inputs")]
    root: Option<PathBuf>,

    /// Destination directory for extracted frames
    #[arg(long, value_name = "DIR", default_value = "extracted")]
    dest: PathBuf,

    /// Optional limit on the number of frames written per container
    #[arg(long)]
    limit: Option<u32>,

    /// Overwrite existing frame files instead of skipping them
    #[arg(long)]
    overwrite: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let inputs = resolve_inputs(&args)?;
    if inputs.is_empty() {
        bail!("no ACF containers to extract");
    }

    fs::create_dir_all(&args.dest)
        .with_context(|| format!("creating destination {}", args.dest.display()))?;

    let mut bad_files = 0usize;
    for input in inputs {
        match extract_container(&input, &args) {
            Ok(true) => {}
            Ok(false) => bad_files += 1,
            Err(err) => {
                eprintln!("{}: {err:#}", input.display());
                bad_files += 1;
            }
        }
    }

    if bad_files > 0 {
        bail!("{bad_files} container(s) failed to extract cleanly");
    }
    Ok(())
}

fn resolve_inputs(args: &Args) -> Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();

    if !args.inputs.is_empty() {
        inputs.extend(args.inputs.iter().cloned());
    } else if let Some(root) = args.root.as_ref() {
        for entry in WalkDir::new(root).into_iter().filter_map(|res| res.ok()) {
            if entry.file_type().is_file() {
                // The files come from 8.3 MS-DOS media, so match the
                // extension case-insensitively.
                if entry
                    .path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("acf"))
                    .unwrap_or(false)
                {
                    inputs.push(entry.into_path());
                }
            }
        }
    }

    inputs.sort();
    inputs.dedup();

    Ok(inputs)
}

/// Extracts one container; returns whether every frame decoded cleanly.
fn extract_container(input: &Path, args: &Args) -> Result<bool> {
    let stem = input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.to_string())
        .unwrap_or_else(|| "acf".to_string());
    let out_dir = args.dest.join(stem.to_ascii_uppercase());
    fs::create_dir_all(&out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let bytes = map_input(input)?;
    let mut written = 0u32;
    let summary = parse_acf(&bytes, |frame| {
        if let Some(limit) = args.limit {
            if written >= limit {
                return Ok(());
            }
        }
        let frame_path = out_dir.join(format!("PCX_{}.pcx", frame.index));
        if frame_path.exists() && !args.overwrite {
            return Ok(());
        }
        save_pcx(
            &frame_path,
            frame.width,
            frame.height,
            frame.pixels,
            frame.palette,
        )?;
        written += 1;
        Ok(())
    })
    .with_context(|| format!("parsing {}", input.display()))?;

    if !summary.cameras.is_empty() {
        let vue_path = out_dir.join("SCENE.VUE");
        fs::write(&vue_path, render_vue(&summary.cameras))
            .with_context(|| format!("writing {}", vue_path.display()))?;
    }

    println!(
        "Extracted {written} frame(s) from {} into {} ({} camera(s), {} degraded, {} failed)",
        input.display(),
        out_dir.display(),
        summary.cameras.len(),
        summary.degraded_frames,
        summary.failed_frames
    );

    Ok(summary.degraded_frames == 0 && summary.failed_frames == 0)
}

//! Extract 2D keypoints: runs the top-down landmark estimator over a frame
//! directory with per-frame bboxes and writes a keypoints JSON.

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use mview_mocap::config::Config;
use mview_mocap::estimator::{BboxXyxy, TopDownEstimator};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        eprintln!(
            "Usage: {} <frames_dir> <bboxes.json> <output.json> [config.toml]",
            args[0]
        );
        std::process::exit(1);
    }
    let config_path = args.get(4).map(String::as_str).unwrap_or("config.toml");
    let config = Config::load_or_default(config_path);

    // フレーム一覧（ファイル名順）
    let mut frame_paths: Vec<PathBuf> = fs::read_dir(&args[1])
        .with_context(|| format!("Failed to read frames dir {}", args[1]))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("jpg") | Some("jpeg") | Some("png") | Some("bmp")
            )
        })
        .collect();
    frame_paths.sort();
    if frame_paths.is_empty() {
        bail!("No image files found in {}", args[1]);
    }

    // BBox: [n_frame][n_person][5] (xyxy + score)
    let content = fs::read_to_string(&args[2])
        .with_context(|| format!("Failed to read bbox file {}", args[2]))?;
    let raw: Vec<Vec<[f32; 5]>> =
        serde_json::from_str(&content).context("Failed to parse bbox json")?;
    if raw.len() != frame_paths.len() {
        bail!(
            "Bbox json has {} frames, directory has {}",
            raw.len(),
            frame_paths.len()
        );
    }
    let bboxes: Vec<Vec<BboxXyxy>> = raw
        .into_iter()
        .map(|frame| frame.into_iter().map(BboxXyxy::from_array).collect())
        .collect();

    let mut estimator = TopDownEstimator::new(config.estimator.clone())?;
    let (kps_list, _bbox_list) =
        estimator.infer_frames(&frame_paths, &bboxes, config.estimator.load_batch_size)?;

    let data: Vec<Vec<Vec<[f32; 3]>>> = kps_list
        .iter()
        .map(|frame| {
            frame
                .outer_iter()
                .map(|person| {
                    person
                        .outer_iter()
                        .map(|kp| [kp[0], kp[1], kp[2]])
                        .collect()
                })
                .collect()
        })
        .collect();
    let out = serde_json::json!({
        "convention": estimator.convention(),
        "data": data,
    });
    fs::write(&args[3], serde_json::to_string(&out)?)
        .with_context(|| format!("Failed to write {}", args[3]))?;

    eprintln!("Wrote keypoints for {} frames to {}", data.len(), args[3]);
    Ok(())
}

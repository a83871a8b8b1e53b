//! Render a scene's converted 2D detections (joint candidates and PAF links)
//! to PNG files for debugging.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use opencv::imgcodecs;

use mview_mocap::config::Config;
use mview_mocap::dataset::{visualize, BottomUpMviewMpersonDataset, ImagePipeline};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <scene_idx> <output_dir> [config.toml]", args[0]);
        std::process::exit(1);
    }
    let scene_idx: usize = args[1].parse().context("scene_idx must be an integer")?;
    let out_dir = &args[2];
    let config_path = args.get(3).map(String::as_str).unwrap_or("config.toml");
    let config = Config::load_or_default(config_path);

    let pipeline = ImagePipeline::from_resize(config.dataset.img_resize);
    let dataset = BottomUpMviewMpersonDataset::new(&config.dataset, pipeline)?;
    let scene = dataset
        .scene(scene_idx)
        .with_context(|| format!("Scene {} out of range ({} scenes)", scene_idx, dataset.n_scene()))?;

    fs::create_dir_all(out_dir)?;
    for frame in 0..scene.n_frame {
        for view in 0..scene.n_view() {
            let cam = &scene.cameras[view];
            let mut canvas = visualize::blank_canvas(cam.width, cam.height)?;
            visualize::draw_bottom_up_detection(
                &mut canvas,
                &scene.kps2d[view][frame],
                &config.dataset.kps2d_convention,
                0.0,
            )?;
            let path = Path::new(out_dir).join(format!("cam{}_frame{}.png", view, frame));
            imgcodecs::imwrite(&path.to_string_lossy(), &canvas, &opencv::core::Vector::new())?;
        }
    }

    eprintln!(
        "Rendered {} frames x {} views to {}",
        scene.n_frame,
        scene.n_view(),
        out_dir
    );
    Ok(())
}

use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array2, Array3, Array4, Axis};
use std::path::{Path, PathBuf};

use crate::config::DatasetConfig;
use crate::convention::BottomUpDetection;
use crate::dataset::pipeline::ImagePipeline;
use crate::dataset::scene::Scene;

/// データセットが返す1フレーム分のデータ
#[derive(Debug)]
pub struct FrameSample {
    /// マルチビュー画像 (n_view, h, w, 3)
    pub images: Array4<f32>,
    /// 内部パラメータ (n_view, k_dim, k_dim)
    pub intrinsics: Array3<f32>,
    /// 回転行列 (n_view, 3, 3)
    pub rotations: Array3<f32>,
    /// 並進ベクトル (n_view, 3)
    pub translations: Array2<f32>,
    /// GT 3Dキーポイント (n_person, n_kps, 4)。confidence 0 は無効点
    pub kps3d: Array3<f32>,
    /// クリップ（シーン）最終フレームならtrue。shuffled時は常にfalse
    pub end_of_clip: bool,
    /// ビューごとの2D検出（規約変換・ピクセル座標化済み）
    pub kps2d: Vec<BottomUpDetection>,
}

/// bottom-upマルチビュー・マルチパーソンデータセット
///
/// メタデータディレクトリ直下の scene_{i}/ を連番で走査し、
/// 全シーンのフレームを単一のインデックス空間として公開する。
pub struct BottomUpMviewMpersonDataset {
    data_root: PathBuf,
    pipeline: ImagePipeline,
    shuffled: bool,
    cam_k_dim: usize,
    scenes: Vec<Scene>,
}

impl BottomUpMviewMpersonDataset {
    pub fn new(config: &DatasetConfig, pipeline: ImagePipeline) -> Result<Self> {
        let meta_path = Path::new(&config.meta_path);
        let metric_scale = config.metric_scale()? as f64;

        let mut scenes = Vec::new();
        loop {
            let scene_dir = meta_path.join(format!("scene_{}", scenes.len()));
            if !scene_dir.is_dir() {
                break;
            }
            let mut scene = Scene::load(
                &scene_dir,
                &config.kps2d_convention,
                config.gt_kps3d_convention.as_deref(),
            )
            .with_context(|| format!("Failed to load {}", scene_dir.display()))?;

            // カメラを要求された方向・単位へ揃える
            let cameras = std::mem::take(&mut scene.cameras);
            scene.cameras = cameras
                .into_iter()
                .map(|cam| {
                    let mut cam = cam.into_direction(config.cam_world2cam);
                    cam.scale_translation(metric_scale);
                    cam
                })
                .collect();
            // GT座標も同じ係数で換算（confidence列は変更しない）
            if metric_scale != 1.0 {
                let scale = metric_scale as f32;
                for frame in scene.gt_kps3d.iter_mut() {
                    for mut kp in frame.rows_mut() {
                        kp[0] *= scale;
                        kp[1] *= scale;
                        kp[2] *= scale;
                    }
                }
            }
            scenes.push(scene);
        }
        if scenes.is_empty() {
            bail!("No scene_* directories found under {}", meta_path.display());
        }

        Ok(Self {
            data_root: PathBuf::from(&config.data_root),
            pipeline,
            shuffled: config.shuffled,
            cam_k_dim: config.cam_k_dim,
            scenes,
        })
    }

    pub fn len(&self) -> usize {
        self.scenes.iter().map(|s| s.n_frame).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_scene(&self) -> usize {
        self.scenes.len()
    }

    pub fn scene(&self, scene_idx: usize) -> Option<&Scene> {
        self.scenes.get(scene_idx)
    }

    /// 全体インデックス → (シーン, フレーム, クリップ末尾フラグ)
    pub fn process_index(&self, index: usize) -> Option<(usize, usize, bool)> {
        let frames: Vec<usize> = self.scenes.iter().map(|s| s.n_frame).collect();
        index_to_scene_frame(&frames, index)
    }

    /// インデックス位置のフレームを読み込む
    pub fn get(&self, index: usize) -> Result<FrameSample> {
        let (scene_idx, frame_idx, end_of_clip) = self
            .process_index(index)
            .ok_or_else(|| anyhow!("Index {} out of range (len {})", index, self.len()))?;
        let scene = &self.scenes[scene_idx];
        let n_view = scene.n_view();

        // マルチビュー画像
        let mut images = Vec::with_capacity(n_view);
        for view in 0..n_view {
            let rela_path = &scene.image_lists[view][frame_idx];
            let img_path = self.data_root.join(rela_path);
            let tensor = self
                .pipeline
                .load(&img_path)
                .with_context(|| format!("Failed to load image {}", img_path.display()))?;
            images.push(tensor);
        }
        let views: Vec<_> = images.iter().map(|t| t.view()).collect();
        let images = ndarray::stack(Axis(0), &views)
            .context("View images differ in shape; set img_resize to unify them")?;

        // カメラパラメータ
        let mut intrinsics = Array3::<f32>::zeros((n_view, self.cam_k_dim, self.cam_k_dim));
        let mut rotations = Array3::<f32>::zeros((n_view, 3, 3));
        let mut translations = Array2::<f32>::zeros((n_view, 3));
        for (view, cam) in scene.cameras.iter().enumerate() {
            intrinsics
                .index_axis_mut(Axis(0), view)
                .assign(&cam.intrinsic(self.cam_k_dim)?);
            rotations
                .index_axis_mut(Axis(0), view)
                .assign(&cam.rotation());
            translations
                .index_axis_mut(Axis(0), view)
                .assign(&cam.translation());
        }

        let kps3d = scene.gt_kps3d[frame_idx].clone();
        let kps2d = (0..n_view)
            .map(|view| scene.kps2d[view][frame_idx].clone())
            .collect();

        Ok(FrameSample {
            images,
            intrinsics,
            rotations,
            translations,
            kps3d,
            end_of_clip: end_of_clip && !self.shuffled,
            kps2d,
        })
    }
}

/// 連結インデックスをシーン内フレームへ写像する
///
/// 戻り値の第3要素は「シーン最終フレームか」。範囲外はNone。
fn index_to_scene_frame(
    frames_per_scene: &[usize],
    index: usize,
) -> Option<(usize, usize, bool)> {
    let mut remaining = index;
    for (scene_idx, &n_frame) in frames_per_scene.iter().enumerate() {
        if remaining < n_frame {
            let end_of_clip = remaining + 1 == n_frame;
            return Some((scene_idx, remaining, end_of_clip));
        }
        remaining -= n_frame;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::{core, imgcodecs};
    use std::fs;

    #[test]
    fn test_index_mapping_single_scene() {
        let frames = [5];
        assert_eq!(index_to_scene_frame(&frames, 0), Some((0, 0, false)));
        assert_eq!(index_to_scene_frame(&frames, 4), Some((0, 4, true)));
        assert_eq!(index_to_scene_frame(&frames, 5), None);
    }

    #[test]
    fn test_index_mapping_multi_scene() {
        let frames = [3, 2, 4];
        // シーン境界
        assert_eq!(index_to_scene_frame(&frames, 2), Some((0, 2, true)));
        assert_eq!(index_to_scene_frame(&frames, 3), Some((1, 0, false)));
        assert_eq!(index_to_scene_frame(&frames, 4), Some((1, 1, true)));
        assert_eq!(index_to_scene_frame(&frames, 8), Some((2, 3, true)));
        assert_eq!(index_to_scene_frame(&frames, 9), None);
    }

    #[test]
    fn test_index_mapping_empty() {
        assert_eq!(index_to_scene_frame(&[], 0), None);
    }

    /// 1シーン分のメタデータと32x24のPNGフレームを書き出す
    fn write_scene(
        scene_dir: &Path,
        data_root: &Path,
        scene_idx: usize,
        n_view: usize,
        n_frame: usize,
    ) {
        let cam_dir = scene_dir.join("camera_parameters");
        fs::create_dir_all(&cam_dir).unwrap();
        for view in 0..n_view {
            let cam = crate::camera::FisheyeCameraParameter::from_intrinsics(
                30.0, 30.0, 16.0, 12.0, 32, 24,
            );
            cam.save(cam_dir.join(format!("fisheye_param_{:02}.json", view)))
                .unwrap();

            let mut list = String::new();
            for frame in 0..n_frame {
                let rela = format!("scene{}/view{}/frame{}.png", scene_idx, view, frame);
                let img_path = data_root.join(&rela);
                fs::create_dir_all(img_path.parent().unwrap()).unwrap();
                let mat = core::Mat::new_rows_cols_with_default(
                    24,
                    32,
                    core::CV_8UC3,
                    core::Scalar::all(128.0),
                )
                .unwrap();
                imgcodecs::imwrite(&img_path.to_string_lossy(), &mat, &core::Vector::new())
                    .unwrap();
                list.push_str(&rela);
                list.push('\n');
            }
            fs::write(
                scene_dir.join(format!("image_list_view_{:02}.txt", view)),
                list,
            )
            .unwrap();
        }

        let person: Vec<[f32; 4]> = vec![[1.0, 2.0, 3.0, 1.0]; 17];
        let gt = serde_json::json!({
            "convention": "coco",
            "data": vec![vec![person]; n_frame],
        });
        fs::write(scene_dir.join("keypoints3d_GT.json"), gt.to_string()).unwrap();

        // 2D検出: 全関節で候補なし
        let joints: Vec<serde_json::Value> = vec![serde_json::json!([]); 17];
        let pafs: Vec<serde_json::Value> = crate::convention::get_convention("coco")
            .unwrap()
            .paf_pairs
            .iter()
            .map(|_| serde_json::json!([]))
            .collect();
        let det = serde_json::json!({ "joints": joints, "pafs": pafs });
        let kps2d = serde_json::json!({
            "convention": "coco",
            "data": vec![vec![det; n_frame]; n_view],
        });
        fs::write(scene_dir.join("kps2d_paf.json"), kps2d.to_string()).unwrap();
    }

    fn synthetic_config(meta: &Path, data: &Path) -> DatasetConfig {
        let mut config = DatasetConfig::default();
        config.meta_path = meta.to_string_lossy().into_owned();
        config.data_root = data.to_string_lossy().into_owned();
        config.kps2d_convention = "coco".to_string();
        config
    }

    #[test]
    fn test_get_frame_sample() {
        let root =
            std::env::temp_dir().join(format!("mview_dataset_test_{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let meta = root.join("meta");
        let data = root.join("data");
        write_scene(&meta.join("scene_0"), &data, 0, 2, 3);
        write_scene(&meta.join("scene_1"), &data, 1, 2, 2);

        let config = synthetic_config(&meta, &data);
        let dataset =
            BottomUpMviewMpersonDataset::new(&config, ImagePipeline::from_resize(None)).unwrap();
        assert_eq!(dataset.n_scene(), 2);
        assert_eq!(dataset.len(), 5);

        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.images.shape(), &[2, 24, 32, 3]);
        assert_eq!(sample.intrinsics.shape(), &[2, 3, 3]);
        assert_eq!(sample.rotations.shape(), &[2, 3, 3]);
        assert_eq!(sample.translations.shape(), &[2, 3]);
        assert_eq!(sample.kps3d.shape(), &[1, 17, 4]);
        assert_eq!(sample.kps2d.len(), 2);
        assert!(!sample.end_of_clip);

        // end_of_clipは各シーンの最終フレームのみ
        assert!(!dataset.get(1).unwrap().end_of_clip);
        assert!(dataset.get(2).unwrap().end_of_clip);
        assert!(!dataset.get(3).unwrap().end_of_clip);
        assert!(dataset.get(4).unwrap().end_of_clip);
        assert!(dataset.get(5).is_err());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_get_shuffled_suppresses_end_of_clip() {
        let root = std::env::temp_dir().join(format!(
            "mview_dataset_shuffled_test_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        let meta = root.join("meta");
        let data = root.join("data");
        write_scene(&meta.join("scene_0"), &data, 0, 1, 2);

        let mut config = synthetic_config(&meta, &data);
        config.shuffled = true;
        let dataset =
            BottomUpMviewMpersonDataset::new(&config, ImagePipeline::from_resize(None)).unwrap();

        // シーン最終フレームでもshuffled時はfalse
        assert!(!dataset.get(1).unwrap().end_of_clip);

        let _ = fs::remove_dir_all(&root);
    }
}

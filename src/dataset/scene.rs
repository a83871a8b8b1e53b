use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::camera::FisheyeCameraParameter;
use crate::convention::{
    convert_bottom_up_kps_paf, convert_kps3d, get_convention, get_keypoint_num,
    BottomUpDetection, KeypointConvention,
};

/// `keypoints3d_GT.json` のスキーマ
///
/// data: (n_frame, n_person, n_kps, 4)、最終次元は [x, y, z, confidence]
#[derive(Debug, Deserialize)]
struct Kps3dFile {
    convention: String,
    data: Vec<Vec<Vec<[f32; 4]>>>,
}

/// `kps2d_paf.json` のスキーマ（dataは [view][frame] で索引）
#[derive(Debug, Deserialize)]
struct Kps2dPafFile {
    convention: String,
    data: Vec<Vec<RawDetection>>,
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    joints: Vec<Vec<[f32; 3]>>,
    pafs: Vec<Vec<Vec<f32>>>,
}

impl RawDetection {
    /// 行列化しつつ規約に対して形状を検証する
    fn into_detection(self, convention: &KeypointConvention) -> Result<BottomUpDetection> {
        if self.joints.len() != convention.joint_names.len() {
            bail!(
                "Expected {} joint lists for convention {}, got {}",
                convention.joint_names.len(),
                convention.name,
                self.joints.len()
            );
        }
        if self.pafs.len() != convention.paf_pairs.len() {
            bail!(
                "Expected {} paf matrices for convention {}, got {}",
                convention.paf_pairs.len(),
                convention.name,
                self.pafs.len()
            );
        }

        let joints = self
            .joints
            .into_iter()
            .map(|cands| {
                let n = cands.len();
                let flat: Vec<f32> = cands.into_iter().flatten().collect();
                Array2::from_shape_vec((n, 3), flat).context("Malformed joint candidates")
            })
            .collect::<Result<Vec<_>>>()?;

        let pafs = self
            .pafs
            .into_iter()
            .map(|rows| {
                let ca = rows.len();
                let cb = rows.first().map_or(0, |r| r.len());
                if rows.iter().any(|r| r.len() != cb) {
                    bail!("Ragged paf matrix");
                }
                let flat: Vec<f32> = rows.into_iter().flatten().collect();
                Array2::from_shape_vec((ca, cb), flat).context("Malformed paf matrix")
            })
            .collect::<Result<Vec<_>>>()?;

        for (idx, (&(a, b), paf)) in convention.paf_pairs.iter().zip(&pafs).enumerate() {
            if paf.nrows() != joints[a].nrows() || paf.ncols() != joints[b].nrows() {
                bail!(
                    "Paf {} is {}x{} but joints {}/{} have {}/{} candidates",
                    idx,
                    paf.nrows(),
                    paf.ncols(),
                    a,
                    b,
                    joints[a].nrows(),
                    joints[b].nrows()
                );
            }
        }

        Ok(BottomUpDetection { joints, pafs })
    }
}

/// 1シーン分のメタデータ
///
/// データコンバータ出力のレイアウト:
/// ```text
/// scene_{i}/
///   camera_parameters/fisheye_param_{view:02}.json
///   image_list_view_{view:02}.txt
///   keypoints3d_GT.json
///   kps2d_paf.json
/// ```
#[derive(Debug)]
pub struct Scene {
    pub name: String,
    pub cameras: Vec<FisheyeCameraParameter>,
    /// [view][frame] data_rootからの相対パス
    pub image_lists: Vec<Vec<String>>,
    /// [frame] (n_person, n_kps, 4)
    pub gt_kps3d: Vec<Array3<f32>>,
    pub gt_convention: String,
    /// [view][frame] 変換・ピクセル座標化済みの2D検出
    pub kps2d: Vec<Vec<BottomUpDetection>>,
    pub n_frame: usize,
}

impl Scene {
    pub fn load(
        scene_dir: &Path,
        kps2d_convention: &str,
        gt_kps3d_convention: Option<&str>,
    ) -> Result<Self> {
        let name = scene_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let cameras = load_cameras(scene_dir)?;
        let n_view = cameras.len();

        let image_lists = load_image_lists(scene_dir, n_view)?;
        let n_frame = image_lists[0].len();
        if n_frame == 0 {
            bail!("Scene {} has no frames", name);
        }

        let (gt_kps3d, gt_convention) =
            load_gt_kps3d(scene_dir, n_frame, gt_kps3d_convention)?;
        let kps2d = load_perception_2d(scene_dir, &cameras, n_frame, kps2d_convention)?;

        log::info!(
            "Loaded scene {}: {} views, {} frames, gt convention {}",
            name,
            n_view,
            n_frame,
            gt_convention
        );

        Ok(Self {
            name,
            cameras,
            image_lists,
            gt_kps3d,
            gt_convention,
            kps2d,
            n_frame,
        })
    }

    pub fn n_view(&self) -> usize {
        self.cameras.len()
    }
}

fn load_cameras(scene_dir: &Path) -> Result<Vec<FisheyeCameraParameter>> {
    let cam_dir = scene_dir.join("camera_parameters");
    let mut cameras = Vec::new();
    loop {
        let path = cam_dir.join(format!("fisheye_param_{:02}.json", cameras.len()));
        if !path.exists() {
            break;
        }
        cameras.push(FisheyeCameraParameter::load(&path)?);
    }
    if cameras.is_empty() {
        bail!("No camera parameters found in {}", cam_dir.display());
    }
    Ok(cameras)
}

fn load_image_lists(scene_dir: &Path, n_view: usize) -> Result<Vec<Vec<String>>> {
    let mut image_lists = Vec::with_capacity(n_view);
    for view in 0..n_view {
        let path = scene_dir.join(format!("image_list_view_{:02}.txt", view));
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read image list {}", path.display()))?;
        let list: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        image_lists.push(list);
    }
    let n_frame = image_lists[0].len();
    if image_lists.iter().any(|l| l.len() != n_frame) {
        bail!(
            "Inconsistent frame counts across views in {}",
            scene_dir.display()
        );
    }
    Ok(image_lists)
}

fn load_gt_kps3d(
    scene_dir: &Path,
    n_frame: usize,
    target_convention: Option<&str>,
) -> Result<(Vec<Array3<f32>>, String)> {
    let path = scene_dir.join("keypoints3d_GT.json");
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file: Kps3dFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    if file.data.len() != n_frame {
        bail!(
            "keypoints3d_GT has {} frames, image lists have {}",
            file.data.len(),
            n_frame
        );
    }
    let n_kps = get_keypoint_num(&file.convention)?;

    let mut frames = Vec::with_capacity(n_frame);
    for (frame_idx, persons) in file.data.into_iter().enumerate() {
        let n_person = persons.len();
        let mut arr = Array3::<f32>::zeros((n_person, n_kps, 4));
        for (p, kps) in persons.into_iter().enumerate() {
            if kps.len() != n_kps {
                bail!(
                    "Frame {} person {}: expected {} keypoints, got {}",
                    frame_idx,
                    p,
                    n_kps,
                    kps.len()
                );
            }
            for (k, v) in kps.into_iter().enumerate() {
                for c in 0..4 {
                    arr[[p, k, c]] = v[c];
                }
            }
        }
        frames.push(arr);
    }

    match target_convention {
        Some(target) if target != file.convention => {
            let converted = frames
                .iter()
                .map(|f| convert_kps3d(f, &file.convention, target, true))
                .collect::<Result<Vec<_>>>()?;
            Ok((converted, target.to_string()))
        }
        _ => Ok((frames, file.convention)),
    }
}

/// マルチビューの2D検出を読み込み、規約変換してピクセル座標へ直す
fn load_perception_2d(
    scene_dir: &Path,
    cameras: &[FisheyeCameraParameter],
    n_frame: usize,
    kps2d_convention: &str,
) -> Result<Vec<Vec<BottomUpDetection>>> {
    let path = scene_dir.join("kps2d_paf.json");
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file: Kps2dPafFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    if file.data.len() != cameras.len() {
        bail!(
            "kps2d_paf has {} views, expected {}",
            file.data.len(),
            cameras.len()
        );
    }
    let src_conv = get_convention(&file.convention)?;

    let mut mview = Vec::with_capacity(cameras.len());
    for (view, raw_frames) in file.data.into_iter().enumerate() {
        if raw_frames.len() != n_frame {
            bail!(
                "kps2d_paf view {} has {} frames, expected {}",
                view,
                raw_frames.len(),
                n_frame
            );
        }
        let detections = raw_frames
            .into_iter()
            .map(|raw| raw.into_detection(src_conv))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Malformed detection in kps2d_paf view {}", view))?;
        let mut converted =
            convert_bottom_up_kps_paf(&detections, &file.convention, kps2d_convention, true)?;
        rescale_to_pixels(&mut converted, cameras[view].width, cameras[view].height);
        mview.push(converted);
    }
    Ok(mview)
}

/// 正規化座標 [0, 1] をピクセル座標へ（x *= w-1, y *= h-1）
fn rescale_to_pixels(detections: &mut [BottomUpDetection], width: u32, height: u32) {
    let sx = (width - 1) as f32;
    let sy = (height - 1) as f32;
    for det in detections.iter_mut() {
        for joints in det.joints.iter_mut() {
            for mut row in joints.rows_mut() {
                row[0] *= sx;
                row[1] *= sy;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// 2関節・1接続の最小規約
    const TINY_CONVENTION: KeypointConvention = KeypointConvention {
        name: "tiny",
        joint_names: &["head", "tail"],
        paf_pairs: &[(0, 1)],
    };

    #[test]
    fn test_raw_detection_conversion() {
        let json = r#"{
            "joints": [[[0.1, 0.2, 0.9]], [[0.3, 0.4, 0.8], [0.5, 0.6, 0.7]]],
            "pafs": [[[0.5, 0.2]]]
        }"#;
        let raw: RawDetection = serde_json::from_str(json).unwrap();
        let det = raw.into_detection(&TINY_CONVENTION).unwrap();
        assert_eq!(det.joints.len(), 2);
        assert_eq!(det.joints[0].shape(), &[1, 3]);
        assert_eq!(det.joints[1].shape(), &[2, 3]);
        assert_eq!(det.pafs[0].shape(), &[1, 2]);
        assert_eq!(det.pafs[0][[0, 1]], 0.2);
    }

    #[test]
    fn test_raw_detection_ragged_paf() {
        let json = r#"{
            "joints": [[], []],
            "pafs": [[[0.5, 0.1], [0.2]]]
        }"#;
        let raw: RawDetection = serde_json::from_str(json).unwrap();
        assert!(raw.into_detection(&TINY_CONVENTION).is_err());
    }

    #[test]
    fn test_raw_detection_paf_dims_mismatch() {
        // 候補数より大きいPAF行列は読み込み時に拒否する
        let json = r#"{
            "joints": [[[0.1, 0.2, 0.9]], []],
            "pafs": [[[0.5, 0.1]]]
        }"#;
        let raw: RawDetection = serde_json::from_str(json).unwrap();
        let err = raw.into_detection(&TINY_CONVENTION).unwrap_err();
        assert!(err.to_string().contains("candidates"));
    }

    #[test]
    fn test_raw_detection_wrong_joint_count() {
        let json = r#"{
            "joints": [[]],
            "pafs": [[]]
        }"#;
        let raw: RawDetection = serde_json::from_str(json).unwrap();
        assert!(raw.into_detection(&TINY_CONVENTION).is_err());
    }

    #[test]
    fn test_rescale_to_pixels() {
        let mut detections = vec![BottomUpDetection {
            joints: vec![array![[1.0, 1.0, 0.9], [0.5, 0.5, 0.8]]],
            pafs: vec![],
        }];
        rescale_to_pixels(&mut detections, 641, 481);
        let joints = &detections[0].joints[0];
        assert_eq!(joints[[0, 0]], 640.0);
        assert_eq!(joints[[0, 1]], 480.0);
        assert_eq!(joints[[1, 0]], 320.0);
        // スコア列は変更しない
        assert_eq!(joints[[0, 2]], 0.9);
    }

    #[test]
    fn test_kps3d_file_parse() {
        let json = r#"{
            "convention": "coco",
            "data": [[
                [[0.0, 0.0, 0.0, 1.0], [0.0, 0.0, 0.0, 1.0], [0.0, 0.0, 0.0, 1.0],
                 [0.0, 0.0, 0.0, 1.0], [0.0, 0.0, 0.0, 1.0], [0.0, 0.0, 0.0, 1.0],
                 [0.0, 0.0, 0.0, 1.0], [0.0, 0.0, 0.0, 1.0], [0.0, 0.0, 0.0, 1.0],
                 [0.0, 0.0, 0.0, 1.0], [0.0, 0.0, 0.0, 1.0], [0.0, 0.0, 0.0, 1.0],
                 [0.0, 0.0, 0.0, 1.0], [0.0, 0.0, 0.0, 1.0], [0.0, 0.0, 0.0, 1.0],
                 [0.0, 0.0, 0.0, 1.0], [1.0, 2.0, 3.0, 0.7]]
            ]]
        }"#;
        let file: Kps3dFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.convention, "coco");
        assert_eq!(file.data.len(), 1);
        assert_eq!(file.data[0][0].len(), 17);
        assert_eq!(file.data[0][0][16], [1.0, 2.0, 3.0, 0.7]);
    }

    #[test]
    fn test_load_missing_scene() {
        let result = Scene::load(Path::new("/no/such/scene"), "fourdag_19", None);
        assert!(result.is_err());
    }

    /// 最小構成のシーンを一時ディレクトリに生成してロードする
    #[test]
    fn test_load_synthetic_scene() {
        let dir = std::env::temp_dir().join(format!("mview_scene_test_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        let cam_dir = dir.join("camera_parameters");
        fs::create_dir_all(&cam_dir).unwrap();

        let n_view = 2;
        let n_frame = 2;
        for view in 0..n_view {
            let cam = crate::camera::FisheyeCameraParameter::from_intrinsics(
                500.0, 500.0, 320.0, 240.0, 641, 481,
            );
            cam.save(cam_dir.join(format!("fisheye_param_{:02}.json", view)))
                .unwrap();
            let list = (0..n_frame)
                .map(|f| format!("view{}/frame{}.png\n", view, f))
                .collect::<String>();
            fs::write(dir.join(format!("image_list_view_{:02}.txt", view)), list).unwrap();
        }

        // GT: coco規約、1人、全点 conf=1
        let person: Vec<[f32; 4]> = vec![[0.0, 0.0, 0.0, 1.0]; 17];
        let gt = serde_json::json!({
            "convention": "coco",
            "data": vec![vec![person.clone()]; n_frame],
        });
        fs::write(dir.join("keypoints3d_GT.json"), gt.to_string()).unwrap();

        // 2D検出: coco規約、noseのみ候補1個 (0.5, 0.5)
        let mut joints: Vec<serde_json::Value> = vec![serde_json::json!([]); 17];
        joints[0] = serde_json::json!([[0.5, 0.5, 0.9]]);
        let cand = |j: usize| if j == 0 { 1 } else { 0 };
        let pafs: Vec<serde_json::Value> = crate::convention::get_convention("coco")
            .unwrap()
            .paf_pairs
            .iter()
            .map(|&(a, b)| {
                let rows = vec![vec![0.0f32; cand(b)]; cand(a)];
                serde_json::json!(rows)
            })
            .collect();
        let det = serde_json::json!({ "joints": joints, "pafs": pafs });
        let kps2d = serde_json::json!({
            "convention": "coco",
            "data": vec![vec![det.clone(); n_frame]; n_view],
        });
        fs::write(dir.join("kps2d_paf.json"), kps2d.to_string()).unwrap();

        let scene = Scene::load(&dir, "fourdag_19", None).unwrap();
        assert_eq!(scene.n_view(), 2);
        assert_eq!(scene.n_frame, 2);
        assert_eq!(scene.gt_convention, "coco");
        assert_eq!(scene.gt_kps3d[0].shape(), &[1, 17, 4]);

        // nose: coco(0) → fourdag_19(4)、ピクセル座標化済み
        let det = &scene.kps2d[0][0];
        assert_eq!(det.joints.len(), 19);
        assert_eq!(det.joints[4].nrows(), 1);
        assert!((det.joints[4][[0, 0]] - 0.5 * 640.0).abs() < 1e-3);
        assert!((det.joints[4][[0, 1]] - 0.5 * 480.0).abs() < 1e-3);

        let _ = fs::remove_dir_all(&dir);
    }
}

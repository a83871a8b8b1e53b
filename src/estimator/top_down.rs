use anyhow::{bail, Context, Result};
use ndarray::{Array2, Array3, Axis};
use opencv::{core::Mat, imgcodecs, prelude::*};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::{Path, PathBuf};

use crate::config::EstimatorConfig;
use crate::convention::get_keypoint_num;
use crate::estimator::crop::{crop_bbox, rescale_landmarks, BboxXyxy};
use crate::estimator::preprocess::preprocess_for_landmark;
use crate::video::VideoReader;

/// top-downランドマーク推定アダプタ
///
/// BBoxでクロップした画像をONNXランドマークモデルに渡し、
/// クロップ内正規化座標の出力をフレームのピクセル座標へ戻す。
/// モデル出力は [1, n_kps, 3]（x, y, visibility）を想定。
pub struct TopDownEstimator {
    session: Session,
    config: EstimatorConfig,
    n_kps: usize,
}

impl TopDownEstimator {
    /// ONNXモデルを読み込んで初期化
    pub fn new(config: EstimatorConfig) -> Result<Self> {
        let n_kps = get_keypoint_num(&config.convention)?;
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(&config.model_path)
            .context("Failed to load landmark ONNX model")?;
        Ok(Self {
            session,
            config,
            n_kps,
        })
    }

    /// モデル出力のキーポイント規約名
    pub fn convention(&self) -> &str {
        &self.config.convention
    }

    pub fn keypoint_num(&self) -> usize {
        self.n_kps
    }

    /// クロップ画像1枚を推論し、クロップ内正規化座標 (n_kps, 3) を返す
    ///
    /// 平均visibilityがpresence_thr以下なら人物なしとしてNone。
    fn infer_crop(&mut self, crop: &Mat) -> Result<Option<Array2<f32>>> {
        let input =
            preprocess_for_landmark(crop, self.config.input_width, self.config.input_height)?;
        let input_tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.config.input_name.as_str() => input_tensor])
            .context("Landmark inference failed")?;

        let output: ndarray::ArrayViewD<f32> = outputs[self.config.output_name.as_str()]
            .try_extract_array()
            .context("Failed to extract landmark output")?;
        let shape = output.shape();
        if shape.len() != 3 || shape[1] != self.n_kps || shape[2] < 3 {
            bail!(
                "Unexpected landmark output shape {:?} (expected [1, {}, 3])",
                shape,
                self.n_kps
            );
        }

        let mut landmarks = Array2::<f32>::zeros((self.n_kps, 3));
        for k in 0..self.n_kps {
            landmarks[[k, 0]] = output[[0, k, 0]];
            landmarks[[k, 1]] = output[[0, k, 1]];
            landmarks[[k, 2]] = output[[0, k, 2]];
        }

        if !presence_detected(&landmarks, self.config.presence_thr) {
            return Ok(None);
        }
        Ok(Some(landmarks))
    }

    /// 1フレーム内の各BBoxを推論する
    ///
    /// スコアがbbox_thr以下のBBoxと、ランドマークが得られなかったBBoxは
    /// 結果に含まれない（入力より少なくなりうる）。
    pub fn infer_single_image(
        &mut self,
        frame: &Mat,
        bboxes: &[BboxXyxy],
    ) -> Result<Vec<(BboxXyxy, Array2<f32>)>> {
        let mut results = Vec::new();
        for bbox in bboxes {
            if !bbox_score_passes(bbox.score, self.config.bbox_thr) {
                continue;
            }
            let Some((cropped, clamped)) = crop_bbox(frame, bbox)? else {
                log::debug!("Skipping bbox outside frame: {:?}", bbox);
                continue;
            };
            let Some(landmarks) = self.infer_crop(&cropped)? else {
                continue;
            };
            results.push((*bbox, rescale_landmarks(&landmarks, &clamped)));
        }
        Ok(results)
    }

    /// メモリ上のフレーム列を推論する
    ///
    /// フレームごとに (n_person, n_kps, 3) のキーポイント配列と
    /// (n_person, 5) のBBox配列を返す。n_personは入力BBox数で、
    /// 検出の無いスロットはゼロのまま。有効BBoxの無いフレームは空配列。
    pub fn infer_array(
        &mut self,
        frames: &[Mat],
        bboxes: &[Vec<BboxXyxy>],
    ) -> Result<(Vec<Array3<f32>>, Vec<Array2<f32>>)> {
        if frames.len() != bboxes.len() {
            bail!(
                "Got {} frames but {} bbox lists",
                frames.len(),
                bboxes.len()
            );
        }

        let mut kps_list = Vec::with_capacity(frames.len());
        let mut bbox_list = Vec::with_capacity(frames.len());
        for (frame, frame_bboxes) in frames.iter().zip(bboxes) {
            let valid: Vec<BboxXyxy> = frame_bboxes
                .iter()
                .copied()
                .filter(|b| b.score > 0.0)
                .collect();
            if valid.is_empty() {
                kps_list.push(Array3::zeros((0, self.n_kps, 3)));
                bbox_list.push(Array2::zeros((0, 5)));
                continue;
            }

            let results = self.infer_single_image(frame, &valid)?;
            let n_slot = frame_bboxes.len();
            let mut kps = Array3::<f32>::zeros((n_slot, self.n_kps, 3));
            let mut out_bbox = Array2::<f32>::zeros((n_slot, 5));
            for (idx, (bbox, landmarks)) in results.iter().enumerate() {
                kps.index_axis_mut(Axis(0), idx).assign(landmarks);
                let arr = bbox.to_array();
                for c in 0..5 {
                    out_bbox[[idx, c]] = arr[c];
                }
            }
            kps_list.push(kps);
            bbox_list.push(out_bbox);
        }
        Ok((kps_list, bbox_list))
    }

    /// 画像ファイル列を推論する
    ///
    /// load_batch_sizeごとに読み込んで逐次推論する（メモリ制御用）。
    pub fn infer_frames(
        &mut self,
        frame_paths: &[PathBuf],
        bboxes: &[Vec<BboxXyxy>],
        load_batch_size: Option<usize>,
    ) -> Result<(Vec<Array3<f32>>, Vec<Array2<f32>>)> {
        if frame_paths.len() != bboxes.len() {
            bail!(
                "Got {} frame paths but {} bbox lists",
                frame_paths.len(),
                bboxes.len()
            );
        }
        let total = frame_paths.len();
        let batch = load_batch_size.unwrap_or(total.max(1));
        if batch == 0 {
            bail!("load_batch_size must be positive");
        }

        let mut all_kps = Vec::with_capacity(total);
        let mut all_bbox = Vec::with_capacity(total);
        for (start, end) in batch_ranges(total, batch) {
            if batch < total {
                log::info!("Processing frames ({}-{})/{}", start, end, total);
            }
            let mut frames = Vec::with_capacity(end - start);
            for path in &frame_paths[start..end] {
                let mat = imgcodecs::imread(&path.to_string_lossy(), imgcodecs::IMREAD_COLOR)?;
                if mat.empty() {
                    bail!("Failed to read frame {}", path.display());
                }
                frames.push(mat);
            }
            let (kps, bbox) = self.infer_array(&frames, &bboxes[start..end])?;
            all_kps.extend(kps);
            all_bbox.extend(bbox);
        }
        Ok((all_kps, all_bbox))
    }

    /// 動画ファイルの全フレームを推論する
    ///
    /// 動画のフレーム数はBBoxリスト数と一致している必要がある。
    pub fn infer_video<P: AsRef<Path>>(
        &mut self,
        video_path: P,
        bboxes: &[Vec<BboxXyxy>],
    ) -> Result<(Vec<Array3<f32>>, Vec<Array2<f32>>)> {
        let mut reader = VideoReader::open(video_path.as_ref())?;
        let frames = reader.read_all(None)?;
        if frames.len() != bboxes.len() {
            bail!(
                "Video has {} frames but got {} bbox lists",
                frames.len(),
                bboxes.len()
            );
        }
        self.infer_array(&frames, bboxes)
    }
}

/// BBoxスコアの採用判定。bbox_thr以下は棄却
fn bbox_score_passes(score: f32, bbox_thr: f32) -> bool {
    score > bbox_thr
}

/// 平均visibilityによる人物有無の判定。presence_thr以下は人物なし
fn presence_detected(landmarks: &Array2<f32>, presence_thr: f32) -> bool {
    if landmarks.nrows() == 0 {
        return false;
    }
    let mean = landmarks.column(2).sum() / landmarks.nrows() as f32;
    mean > presence_thr
}

/// [0, total) を幅batchの半開区間に分割する
fn batch_ranges(total: usize, batch: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < total {
        let end = (start + batch).min(total);
        ranges.push((start, end));
        start = end;
    }
    ranges
}

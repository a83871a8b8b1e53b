use anyhow::Result;
use ndarray::Array2;
use opencv::{
    core::{Mat, Rect},
    prelude::*,
};

/// 人物BBox（ピクセルxyxy + 検出スコア）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BboxXyxy {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl BboxXyxy {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Self {
        Self { x1, y1, x2, y2, score }
    }

    pub fn from_array(v: [f32; 5]) -> Self {
        Self::new(v[0], v[1], v[2], v[3], v[4])
    }

    pub fn to_array(&self) -> [f32; 5] {
        [self.x1, self.y1, self.x2, self.y2, self.score]
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// フレーム境界にクリップ
    pub fn clamp(&self, frame_w: u32, frame_h: u32) -> Self {
        let fw = frame_w as f32;
        let fh = frame_h as f32;
        Self {
            x1: self.x1.max(0.0).min(fw),
            y1: self.y1.max(0.0).min(fh),
            x2: self.x2.max(0.0).min(fw),
            y2: self.y2.max(0.0).min(fh),
            score: self.score,
        }
    }

    /// 1ピクセル未満のBBoxは切り出せない
    pub fn is_degenerate(&self) -> bool {
        self.width() < 1.0 || self.height() < 1.0
    }
}

/// BBox領域をフレームから切り出す
///
/// 境界クリップ後のBBoxも返す（ランドマーク復元はこちらを基準にする）。
/// クリップ後に面積が無い場合はNone。
pub fn crop_bbox(frame: &Mat, bbox: &BboxXyxy) -> Result<Option<(Mat, BboxXyxy)>> {
    let clamped = bbox.clamp(frame.cols() as u32, frame.rows() as u32);
    if clamped.is_degenerate() {
        return Ok(None);
    }

    let roi = Rect::new(
        clamped.x1 as i32,
        clamped.y1 as i32,
        (clamped.width() as i32).max(1),
        (clamped.height() as i32).max(1),
    );
    let cropped = Mat::roi(frame, roi)?;
    Ok(Some((cropped.try_clone()?, clamped)))
}

/// クロップ内正規化座標のランドマークをフレームのピクセル座標へ戻す
///
/// landmarks: (n_kps, 3) 各行 [x, y, visibility]、x/yはクロップ内 [0, 1]。
/// 出力はx/yのみ変換し、visibilityはそのまま。
pub fn rescale_landmarks(landmarks: &Array2<f32>, crop: &BboxXyxy) -> Array2<f32> {
    let mut out = landmarks.clone();
    let w = crop.width();
    let h = crop.height();
    for mut row in out.rows_mut() {
        row[0] = row[0] * w + crop.x1;
        row[1] = row[1] * h + crop.y1;
    }
    out
}

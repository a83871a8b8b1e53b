use anyhow::{bail, Result};
use ndarray::Array3;
use opencv::{
    core::{Mat, Size, Vec3f, CV_32FC3},
    imgcodecs, imgproc,
    prelude::*,
};
use std::path::Path;

/// 画像読み込み後に適用する変換
#[derive(Debug, Clone)]
pub enum ImageOp {
    /// 指定サイズへリサイズ
    Resize { width: u32, height: u32 },
    /// BGR → RGB変換
    BgrToRgb,
    /// [0, 255] → [0.0, 1.0] 正規化
    Normalize,
}

/// 画像変換パイプライン
///
/// 全ビューの画像を同一形状に揃えるため、解像度の異なるカメラが
/// 混在する場合はResizeを入れること。
#[derive(Debug, Clone, Default)]
pub struct ImagePipeline {
    ops: Vec<ImageOp>,
}

impl ImagePipeline {
    pub fn new(ops: Vec<ImageOp>) -> Self {
        Self { ops }
    }

    /// データセット設定から構築（リサイズ指定があればResizeのみ）
    pub fn from_resize(resize: Option<[u32; 2]>) -> Self {
        let ops = match resize {
            Some([width, height]) => vec![ImageOp::Resize { width, height }],
            None => Vec::new(),
        };
        Self { ops }
    }

    /// ファイルから読み込んで (h, w, 3) f32テンソルを返す
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Array3<f32>> {
        let path_str = path.as_ref().to_string_lossy();
        let mat = imgcodecs::imread(&path_str, imgcodecs::IMREAD_COLOR)?;
        if mat.empty() {
            bail!("Failed to read image {}", path.as_ref().display());
        }
        self.apply(&mat)
    }

    /// Matに変換列を適用して (h, w, 3) f32テンソルを返す
    pub fn apply(&self, frame: &Mat) -> Result<Array3<f32>> {
        let mut mat = frame.clone();
        let mut normalize = false;

        for op in &self.ops {
            match op {
                ImageOp::Resize { width, height } => {
                    let mut resized = Mat::default();
                    imgproc::resize(
                        &mat,
                        &mut resized,
                        Size::new(*width as i32, *height as i32),
                        0.0,
                        0.0,
                        imgproc::INTER_LINEAR,
                    )?;
                    mat = resized;
                }
                ImageOp::BgrToRgb => {
                    let mut rgb = Mat::default();
                    imgproc::cvt_color_def(&mat, &mut rgb, imgproc::COLOR_BGR2RGB)?;
                    mat = rgb;
                }
                ImageOp::Normalize => normalize = true,
            }
        }

        let scale = if normalize { 1.0 / 255.0 } else { 1.0 };
        let mut float_mat = Mat::default();
        mat.convert_to(&mut float_mat, CV_32FC3, scale, 0.0)?;

        let h = float_mat.rows() as usize;
        let w = float_mat.cols() as usize;
        let mut tensor = Array3::<f32>::zeros((h, w, 3));
        for y in 0..h {
            for x in 0..w {
                let pixel = float_mat.at_2d::<Vec3f>(y as i32, x as i32)?;
                tensor[[y, x, 0]] = pixel[0];
                tensor[[y, x, 1]] = pixel[1];
                tensor[[y, x, 2]] = pixel[2];
            }
        }
        Ok(tensor)
    }
}

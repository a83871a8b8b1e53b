use anyhow::{bail, Result};
use opencv::{
    core::{Mat, Point, Scalar, CV_8UC3},
    imgproc,
    prelude::*,
};

use crate::convention::{get_convention, BottomUpDetection};

/// 関節候補の色 (BGR)
const JOINT_COLOR: [f64; 3] = [0.0, 0.0, 255.0];
/// PAF接続線の色 (BGR)
const PAF_COLOR: [f64; 3] = [255.0, 0.0, 0.0];
/// ラベル文字の色 (BGR)
const LABEL_COLOR: [f64; 3] = [0.0, 255.0, 255.0];

fn scalar(color: [f64; 3]) -> Scalar {
    Scalar::new(color[0], color[1], color[2], 0.0)
}

/// 検出デバッグ描画用の無地キャンバス
pub fn blank_canvas(width: u32, height: u32) -> Result<Mat> {
    let canvas = Mat::new_rows_cols_with_default(
        height as i32,
        width as i32,
        CV_8UC3,
        Scalar::all(200.0),
    )?;
    Ok(canvas)
}

/// bottom-up検出を画像へ描画する
///
/// PAFスコアがpaf_thrを超える候補ペアを線で結び、中点にスコアを表示。
/// 関節候補は点と関節インデックスで表示。座標はピクセル前提。
pub fn draw_bottom_up_detection(
    img: &mut Mat,
    det: &BottomUpDetection,
    convention: &str,
    paf_thr: f32,
) -> Result<()> {
    let conv = get_convention(convention)?;
    if det.joints.len() != conv.joint_names.len() {
        bail!(
            "Detection has {} joints, convention {} defines {}",
            det.joints.len(),
            convention,
            conv.joint_names.len()
        );
    }

    // PAF接続線
    for (paf_idx, &(a, b)) in conv.paf_pairs.iter().enumerate() {
        let Some(paf) = det.pafs.get(paf_idx) else {
            continue;
        };
        for ca in 0..paf.nrows() {
            for cb in 0..paf.ncols() {
                let score = paf[[ca, cb]];
                if score <= paf_thr {
                    continue;
                }
                let p1 = Point::new(det.joints[a][[ca, 0]] as i32, det.joints[a][[ca, 1]] as i32);
                let p2 = Point::new(det.joints[b][[cb, 0]] as i32, det.joints[b][[cb, 1]] as i32);
                imgproc::line(img, p1, p2, scalar(PAF_COLOR), 2, imgproc::LINE_8, 0)?;
                let mid = Point::new((p1.x + p2.x) / 2, (p1.y + p2.y) / 2);
                imgproc::put_text(
                    img,
                    &format!("{:.3}", score),
                    mid,
                    imgproc::FONT_HERSHEY_SIMPLEX,
                    0.5,
                    scalar(LABEL_COLOR),
                    1,
                    imgproc::LINE_8,
                    false,
                )?;
            }
        }
    }

    // 関節候補
    for (joint_idx, candidates) in det.joints.iter().enumerate() {
        for c in 0..candidates.nrows() {
            let p = Point::new(candidates[[c, 0]] as i32, candidates[[c, 1]] as i32);
            imgproc::circle(img, p, 2, scalar(JOINT_COLOR), -1, imgproc::LINE_8, 0)?;
            imgproc::put_text(
                img,
                &joint_idx.to_string(),
                p,
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                scalar(LABEL_COLOR),
                1,
                imgproc::LINE_8,
                false,
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_blank_canvas_size() {
        let canvas = blank_canvas(320, 240).unwrap();
        assert_eq!(canvas.cols(), 320);
        assert_eq!(canvas.rows(), 240);
    }

    #[test]
    fn test_draw_joint_count_mismatch() {
        let mut canvas = blank_canvas(64, 64).unwrap();
        let det = BottomUpDetection {
            joints: vec![Array2::zeros((0, 3)); 3],
            pafs: vec![],
        };
        assert!(draw_bottom_up_detection(&mut canvas, &det, "fourdag_19", 0.0).is_err());
    }

    #[test]
    fn test_draw_smoke() {
        let mut canvas = blank_canvas(64, 64).unwrap();
        let mut joints: Vec<Array2<f32>> = vec![Array2::zeros((0, 3)); 19];
        joints[4] = array![[10.0, 10.0, 0.9]];
        joints[1] = array![[30.0, 30.0, 0.8]];
        let mut pafs: Vec<Array2<f32>> = Vec::new();
        let conv = get_convention("fourdag_19").unwrap();
        for &(a, b) in conv.paf_pairs {
            pafs.push(Array2::from_elem(
                (joints[a].nrows(), joints[b].nrows()),
                0.6,
            ));
        }
        let det = BottomUpDetection { joints, pafs };
        draw_bottom_up_detection(&mut canvas, &det, "fourdag_19", 0.5).unwrap();
    }
}

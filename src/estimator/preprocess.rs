use anyhow::Result;
use ndarray::Array4;
use opencv::{
    core::{Mat, Size, CV_32FC3},
    imgproc,
    prelude::*,
};

/// BGR Mat → NCHW [1, 3, height, width] f32テンソルに変換
///
/// - BGR -> RGB
/// - 指定サイズにリサイズ
/// - [0, 255] → [0.0, 1.0] 正規化
pub fn preprocess_for_landmark(frame: &Mat, width: i32, height: i32) -> Result<Array4<f32>> {
    // BGR -> RGB
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(frame, &mut rgb, imgproc::COLOR_BGR2RGB)?;

    // リサイズ
    let mut resized = Mat::default();
    imgproc::resize(
        &rgb,
        &mut resized,
        Size::new(width, height),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;

    // f32 に変換
    let mut float_mat = Mat::default();
    resized.convert_to(&mut float_mat, CV_32FC3, 1.0, 0.0)?;

    // NCHW変換 [1, 3, height, width]
    let w = width as usize;
    let h = height as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    let data = float_mat.data_bytes()?;
    let step = float_mat.mat_step().get(0);
    for y in 0..h {
        let row_ptr = unsafe {
            std::slice::from_raw_parts(data.as_ptr().add(y * step) as *const f32, w * 3)
        };
        for x in 0..w {
            for c in 0..3 {
                tensor[[0, c, y, x]] = row_ptr[x * 3 + c] / 255.0;
            }
        }
    }

    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Scalar;

    #[test]
    fn test_preprocess_shape_and_range() {
        // BGR = (255, 0, 0) の青一色
        let frame = Mat::new_rows_cols_with_default(
            48,
            64,
            opencv::core::CV_8UC3,
            Scalar::new(255.0, 0.0, 0.0, 0.0),
        )
        .unwrap();
        let tensor = preprocess_for_landmark(&frame, 32, 24).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 24, 32]);
        // RGB変換後: R=0, G=0, B=1
        assert!((tensor[[0, 0, 0, 0]] - 0.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] - 1.0).abs() < 1e-6);
    }
}

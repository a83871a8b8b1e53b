use anyhow::{Context, Result};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureAPIs},
};
use std::path::Path;

/// 動画ファイルからのフレーム読み出し
pub struct VideoReader {
    capture: VideoCapture,
    width: u32,
    height: u32,
    fps: f64,
}

impl VideoReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy();
        let capture = VideoCapture::from_file(&path_str, VideoCaptureAPIs::CAP_ANY as i32)
            .with_context(|| format!("Failed to open video {}", path.as_ref().display()))?;

        if !capture.is_opened()? {
            anyhow::bail!("Video {} is not available", path.as_ref().display());
        }

        let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
        let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
        let fps = capture.get(videoio::CAP_PROP_FPS)?;

        Ok(Self {
            capture,
            width,
            height,
            fps,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// 次のフレームをBGR Matで返す（終端でNone）
    pub fn next_frame(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        let grabbed = self.capture.read(&mut frame)?;
        if !grabbed || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    /// 残りの全フレームを読み出す（max_framesで打ち切り可）
    pub fn read_all(&mut self, max_frames: Option<usize>) -> Result<Vec<Mat>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
            if let Some(max) = max_frames {
                if frames.len() >= max {
                    break;
                }
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, Size, CV_8UC3};
    use opencv::videoio::VideoWriter;

    #[test]
    fn test_open_missing_video() {
        assert!(VideoReader::open("/no/such/video.mp4").is_err());
    }

    #[test]
    fn test_read_all_written_video() {
        let path =
            std::env::temp_dir().join(format!("mview_video_test_{}.avi", std::process::id()));
        let fourcc = VideoWriter::fourcc('M', 'J', 'P', 'G').unwrap();
        let mut writer = VideoWriter::new(
            &path.to_string_lossy(),
            fourcc,
            10.0,
            Size::new(64, 48),
            true,
        )
        .unwrap();
        assert!(writer.is_opened().unwrap());
        for i in 0..3 {
            let frame = Mat::new_rows_cols_with_default(
                48,
                64,
                CV_8UC3,
                Scalar::all(i as f64 * 40.0),
            )
            .unwrap();
            writer.write(&frame).unwrap();
        }
        writer.release().unwrap();

        let mut reader = VideoReader::open(&path).unwrap();
        assert_eq!(reader.width(), 64);
        assert_eq!(reader.height(), 48);
        // max_frames無しなら全フレーム読む
        assert_eq!(reader.read_all(None).unwrap().len(), 3);

        let mut reader = VideoReader::open(&path).unwrap();
        assert_eq!(reader.read_all(Some(2)).unwrap().len(), 2);

        let _ = std::fs::remove_file(&path);
    }
}

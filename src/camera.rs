use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// fisheyeカメラパラメータ（データコンバータ出力のJSON形式）
///
/// intrinsicは4x4（透視投影互換形式）。3x3が必要な場合は
/// `intrinsic(3)` で左上ブロックから復元する。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FisheyeCameraParameter {
    #[serde(default)]
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// 内部パラメータ行列 K (4x4, row-major)
    pub intrinsic: [[f64; 4]; 4],
    /// 回転行列 (3x3, row-major)
    pub extrinsic_r: [[f64; 3]; 3],
    /// 並進ベクトル
    pub extrinsic_t: [f64; 3],
    /// 放射歪み係数
    #[serde(default)]
    pub k1: f64,
    #[serde(default)]
    pub k2: f64,
    #[serde(default)]
    pub k3: f64,
    #[serde(default)]
    pub k4: f64,
    #[serde(default)]
    pub k5: f64,
    #[serde(default)]
    pub k6: f64,
    /// 接線歪み係数
    #[serde(default)]
    pub p1: f64,
    #[serde(default)]
    pub p2: f64,
    /// 外部パラメータの方向（true: world→camera）
    #[serde(default)]
    pub world2cam: bool,
}

impl FisheyeCameraParameter {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read camera file {}", path.as_ref().display()))?;
        let param: FisheyeCameraParameter = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse camera file {}", path.as_ref().display()))?;
        Ok(param)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json).context("Failed to write camera file")?;
        Ok(())
    }

    /// 焦点距離と主点から4x4内部パラメータを構築
    pub fn from_intrinsics(
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        width: u32,
        height: u32,
    ) -> Self {
        let intrinsic = [
            [fx, 0.0, cx, 0.0],
            [0.0, fy, cy, 0.0],
            [0.0, 0.0, 0.0, 1.0],
            [0.0, 0.0, 1.0, 0.0],
        ];
        Self {
            name: String::new(),
            width,
            height,
            intrinsic,
            extrinsic_r: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            extrinsic_t: [0.0; 3],
            k1: 0.0,
            k2: 0.0,
            k3: 0.0,
            k4: 0.0,
            k5: 0.0,
            k6: 0.0,
            p1: 0.0,
            p2: 0.0,
            world2cam: false,
        }
    }

    /// 内部パラメータ行列を (k_dim, k_dim) で返す
    ///
    /// k_dim=3 は透視投影の [fx 0 cx; 0 fy cy; 0 0 1]、k_dim=4 は保存形式のまま。
    pub fn intrinsic(&self, k_dim: usize) -> Result<Array2<f32>> {
        match k_dim {
            4 => {
                let mut k = Array2::<f32>::zeros((4, 4));
                for r in 0..4 {
                    for c in 0..4 {
                        k[[r, c]] = self.intrinsic[r][c] as f32;
                    }
                }
                Ok(k)
            }
            3 => {
                let mut k = Array2::<f32>::zeros((3, 3));
                k[[0, 0]] = self.intrinsic[0][0] as f32;
                k[[0, 1]] = self.intrinsic[0][1] as f32;
                k[[0, 2]] = self.intrinsic[0][2] as f32;
                k[[1, 1]] = self.intrinsic[1][1] as f32;
                k[[1, 2]] = self.intrinsic[1][2] as f32;
                k[[2, 2]] = 1.0;
                Ok(k)
            }
            other => bail!("Unsupported intrinsic dim: {} (expected 3 or 4)", other),
        }
    }

    /// 回転行列を (3, 3) ndarray で返す
    pub fn rotation(&self) -> Array2<f32> {
        let mut r = Array2::<f32>::zeros((3, 3));
        for row in 0..3 {
            for col in 0..3 {
                r[[row, col]] = self.extrinsic_r[row][col] as f32;
            }
        }
        r
    }

    /// 並進ベクトルを (3,) ndarray で返す
    pub fn translation(&self) -> Array1<f32> {
        Array1::from(vec![
            self.extrinsic_t[0] as f32,
            self.extrinsic_t[1] as f32,
            self.extrinsic_t[2] as f32,
        ])
    }

    /// 外部パラメータを指定方向に揃える
    ///
    /// 格納方向と一致していればそのまま。逆なら R' = R^T, T' = -R^T * T。
    pub fn into_direction(mut self, world2cam: bool) -> Self {
        if self.world2cam == world2cam {
            return self;
        }
        let r = self.extrinsic_r;
        let t = self.extrinsic_t;

        let mut rt = [[0.0f64; 3]; 3];
        for row in 0..3 {
            for col in 0..3 {
                rt[row][col] = r[col][row];
            }
        }
        let mut new_t = [0.0f64; 3];
        for row in 0..3 {
            new_t[row] = -(rt[row][0] * t[0] + rt[row][1] * t[1] + rt[row][2] * t[2]);
        }

        self.extrinsic_r = rt;
        self.extrinsic_t = new_t;
        self.world2cam = world2cam;
        self
    }

    /// 並進ベクトルを単位換算（GTと同じ係数を適用する）
    pub fn scale_translation(&mut self, factor: f64) {
        for v in self.extrinsic_t.iter_mut() {
            *v *= factor;
        }
    }

    /// 歪み補正で使う5係数 [k1, k2, p1, p2, k3]
    pub fn dist_coeffs5(&self) -> [f32; 5] {
        [
            self.k1 as f32,
            self.k2 as f32,
            self.p1 as f32,
            self.p2 as f32,
            self.k3 as f32,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_param() -> FisheyeCameraParameter {
        let mut param =
            FisheyeCameraParameter::from_intrinsics(1000.0, 1000.0, 320.0, 240.0, 640, 480);
        // Z軸周り90度回転 + 並進
        param.extrinsic_r = [[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        param.extrinsic_t = [1.0, 2.0, 3.0];
        param.world2cam = true;
        param
    }

    #[test]
    fn test_intrinsic_33() {
        let param = sample_param();
        let k = param.intrinsic(3).unwrap();
        assert_eq!(k.shape(), &[3, 3]);
        assert_eq!(k[[0, 0]], 1000.0);
        assert_eq!(k[[0, 2]], 320.0);
        assert_eq!(k[[1, 2]], 240.0);
        assert_eq!(k[[2, 2]], 1.0);
    }

    #[test]
    fn test_intrinsic_44_keeps_projection_rows() {
        let param = sample_param();
        let k = param.intrinsic(4).unwrap();
        assert_eq!(k.shape(), &[4, 4]);
        assert_eq!(k[[2, 3]], 1.0);
        assert_eq!(k[[3, 2]], 1.0);
    }

    #[test]
    fn test_intrinsic_bad_dim() {
        let param = sample_param();
        assert!(param.intrinsic(2).is_err());
    }

    #[test]
    fn test_direction_noop() {
        let param = sample_param();
        let same = param.clone().into_direction(true);
        assert_eq!(same.extrinsic_t, param.extrinsic_t);
        assert_eq!(same.extrinsic_r, param.extrinsic_r);
    }

    #[test]
    fn test_direction_roundtrip() {
        let param = sample_param();
        let back = param.clone().into_direction(false).into_direction(true);
        for row in 0..3 {
            assert!((back.extrinsic_t[row] - param.extrinsic_t[row]).abs() < 1e-9);
            for col in 0..3 {
                assert!((back.extrinsic_r[row][col] - param.extrinsic_r[row][col]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_direction_flip_translation() {
        // R = I なら T' = -T
        let mut param = sample_param();
        param.extrinsic_r = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let flipped = param.into_direction(false);
        assert_eq!(flipped.extrinsic_t, [-1.0, -2.0, -3.0]);
        assert!(!flipped.world2cam);
    }

    #[test]
    fn test_scale_translation() {
        let mut param = sample_param();
        param.scale_translation(100.0);
        assert_eq!(param.extrinsic_t, [100.0, 200.0, 300.0]);
    }

    #[test]
    fn test_json_roundtrip() {
        let param = sample_param();
        let json = serde_json::to_string(&param).unwrap();
        let parsed: FisheyeCameraParameter = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.width, 640);
        assert_eq!(parsed.extrinsic_t, param.extrinsic_t);
        assert!(parsed.world2cam);
    }

    #[test]
    fn test_dist_coeffs_default_zero() {
        // 歪み係数を省略したJSONでも読める
        let json = r#"{
            "name": "cam0",
            "width": 640,
            "height": 480,
            "intrinsic": [[500.0,0.0,320.0,0.0],[0.0,500.0,240.0,0.0],[0.0,0.0,0.0,1.0],[0.0,0.0,1.0,0.0]],
            "extrinsic_r": [[1.0,0.0,0.0],[0.0,1.0,0.0],[0.0,0.0,1.0]],
            "extrinsic_t": [0.0,0.0,0.0]
        }"#;
        let param: FisheyeCameraParameter = serde_json::from_str(json).unwrap();
        assert_eq!(param.dist_coeffs5(), [0.0; 5]);
        assert!(!param.world2cam);
    }
}

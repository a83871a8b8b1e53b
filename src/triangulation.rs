use anyhow::Result;
use nalgebra::{Matrix3, Matrix3x4, Matrix4, Vector3, Vector4};
use ndarray::Array2;

use crate::camera::FisheyeCameraParameter;

/// リプロジェクションエラー閾値（ピクセル）
/// 三角測量した3D点をカメラに再投影した際の最大許容誤差
const MAX_REPROJ_ERROR: f32 = 75.0;

/// 三角測量用カメラパラメータ（射影行列 P = K[R|t]）
#[derive(Debug, Clone)]
pub struct CameraParams {
    pub projection: Matrix3x4<f32>,
    pub image_width: f32,
    pub image_height: f32,
    /// 内部パラメータ行列（歪み補正用）
    intrinsic: Matrix3<f32>,
    /// 歪み係数 [k1, k2, p1, p2, k3]
    dist_coeffs: [f32; 5],
}

impl CameraParams {
    /// fisheyeカメラパラメータから射影行列を構築
    ///
    /// 外部パラメータはworld→cam方向に揃えてから使う。
    pub fn from_fisheye(param: &FisheyeCameraParameter) -> Result<Self> {
        let cam = param.clone().into_direction(true);

        let ik = cam.intrinsic(3)?;
        let k = Matrix3::new(
            ik[[0, 0]], ik[[0, 1]], ik[[0, 2]],
            ik[[1, 0]], ik[[1, 1]], ik[[1, 2]],
            ik[[2, 0]], ik[[2, 1]], ik[[2, 2]],
        );

        let r = cam.rotation();
        let t = cam.translation();
        let t = Vector3::new(t[0], t[1], t[2]);

        // P = K * [R | t]
        let mut rt = Matrix3x4::zeros();
        for i in 0..3 {
            for j in 0..3 {
                rt[(i, j)] = r[[i, j]];
            }
            rt[(i, 3)] = t[i];
        }

        Ok(Self {
            projection: k * rt,
            image_width: cam.width as f32,
            image_height: cam.height as f32,
            intrinsic: k,
            dist_coeffs: cam.dist_coeffs5(),
        })
    }

    /// 歪んだピクセル座標を歪み補正して理想ピクセル座標に変換
    /// Newton-Raphson法による歪み補正（大きな歪み係数でも収束）
    pub fn undistort_point(&self, u_dist: f32, v_dist: f32) -> (f32, f32) {
        let fx = self.intrinsic[(0, 0)];
        let fy = self.intrinsic[(1, 1)];
        let cx = self.intrinsic[(0, 2)];
        let cy = self.intrinsic[(1, 2)];
        let [k1, k2, p1, p2, k3] = self.dist_coeffs;

        // 歪み係数がゼロなら補正不要
        if k1 == 0.0 && k2 == 0.0 && p1 == 0.0 && p2 == 0.0 && k3 == 0.0 {
            return (u_dist, v_dist);
        }

        // ピクセル→正規化カメラ座標（歪みあり = ターゲット）
        let xd = (u_dist - cx) / fx;
        let yd = (v_dist - cy) / fy;

        // Newton-Raphson: 順方向歪みモデル f(x,y) = target を解く
        // f_x(x,y) = x*R + 2*p1*x*y + p2*(r2 + 2*x^2)
        // f_y(x,y) = y*R + p1*(r2 + 2*y^2) + 2*p2*x*y
        // R = 1 + k1*r2 + k2*r4 + k3*r6
        let mut x = xd;
        let mut y = yd;
        let mut best_x = x;
        let mut best_y = y;
        let mut best_residual = f32::MAX;

        for _ in 0..30 {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
            let dr_dr2 = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;

            let fx_val = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x) - xd;
            let fy_val = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y - yd;

            let residual = fx_val * fx_val + fy_val * fy_val;
            if residual < best_residual {
                best_residual = residual;
                best_x = x;
                best_y = y;
            }
            if residual < 1e-12 {
                break;
            }

            // ヤコビアン
            let j00 = radial + 2.0 * x * x * dr_dr2 + 2.0 * p1 * y + 6.0 * p2 * x;
            let j01 = 2.0 * x * y * dr_dr2 + 2.0 * p1 * x + 2.0 * p2 * y;
            let j10 = j01; // 対称
            let j11 = radial + 2.0 * y * y * dr_dr2 + 6.0 * p1 * y + 2.0 * p2 * x;

            let det = j00 * j11 - j01 * j10;
            if det.abs() < 1e-10 {
                break; // 特異ヤコビアン → best値を使用
            }

            x += -(j11 * fx_val - j01 * fy_val) / det;
            y += -(-j10 * fx_val + j00 * fy_val) / det;
        }

        (best_x * fx + cx, best_y * fy + cy)
    }
}

/// 単一3D点のDLT三角測量
///
/// N台のカメラの2D観測から3D座標を推定。
/// 各カメラについて x × (P · X) = 0 の形で2行追加し、最小固有値の
/// 固有ベクトルを解とする。
fn triangulate_point(cameras: &[&CameraParams], points_2d: &[(f32, f32)]) -> (f32, f32, f32) {
    let n = cameras.len();
    assert!(n >= 2);

    // A^T * A (4x4) を直接構築
    let mut a = Matrix4::zeros();

    for i in 0..n {
        let p = &cameras[i].projection;
        let (u, v) = points_2d[i];

        let row1 = Vector4::new(
            u * p[(2, 0)] - p[(0, 0)],
            u * p[(2, 1)] - p[(0, 1)],
            u * p[(2, 2)] - p[(0, 2)],
            u * p[(2, 3)] - p[(0, 3)],
        );
        let row2 = Vector4::new(
            v * p[(2, 0)] - p[(1, 0)],
            v * p[(2, 1)] - p[(1, 1)],
            v * p[(2, 2)] - p[(1, 2)],
            v * p[(2, 3)] - p[(1, 3)],
        );

        a += row1 * row1.transpose();
        a += row2 * row2.transpose();
    }

    let eigen = a.symmetric_eigen();
    let mut min_idx = 0;
    let mut min_val = eigen.eigenvalues[0].abs();
    for i in 1..4 {
        let v = eigen.eigenvalues[i].abs();
        if v < min_val {
            min_val = v;
            min_idx = i;
        }
    }

    let x = eigen.eigenvectors.column(min_idx);
    let w = x[3];
    if w.abs() < 1e-10 {
        return (0.0, 0.0, 0.0);
    }

    (x[0] / w, x[1] / w, x[2] / w)
}

/// N台のカメラの2Dキーポイント観測から3Dキーポイントを三角測量する
///
/// observations[view] は (n_kps, 3) のピクセル座標 [x, y, confidence]。
/// - 各キーポイントについて、confidence_threshold以上の観測を集める
/// - 2台以上の有効観測があるキーポイントのみ三角測量
/// - 再投影誤差が閾値を超えた点と観測不足の点はconfidence=0のまま
///
/// 戻り値は (n_kps, 4) で最終列は有効観測の平均confidence。
pub fn triangulate_keypoints(
    cameras: &[&CameraParams],
    observations: &[&Array2<f32>],
    confidence_threshold: f32,
) -> Array2<f32> {
    assert_eq!(cameras.len(), observations.len());
    let n_view = cameras.len();
    let n_kps = observations.first().map_or(0, |o| o.nrows());

    let mut kps3d = Array2::<f32>::zeros((n_kps, 4));

    for kp_idx in 0..n_kps {
        let mut valid_cameras = Vec::new();
        let mut valid_points = Vec::new();
        let mut conf_sum = 0.0f32;

        for view in 0..n_view {
            let obs = observations[view];
            let conf = obs[[kp_idx, 2]];
            if conf >= confidence_threshold && conf > 0.0 {
                let cam = cameras[view];
                // 歪みピクセル座標 → 歪み補正ピクセル座標
                let (u, v) = cam.undistort_point(obs[[kp_idx, 0]], obs[[kp_idx, 1]]);
                valid_cameras.push(cam);
                valid_points.push((u, v));
                conf_sum += conf;
            }
        }

        if valid_cameras.len() < 2 {
            continue;
        }

        let (x, y, z) = triangulate_point(&valid_cameras, &valid_points);

        // 再投影誤差チェック: 誤差の大きい解は棄却
        let point_3d = Vector4::new(x, y, z, 1.0);
        let mut max_reproj_err = 0.0f32;
        for i in 0..valid_cameras.len() {
            let projected = valid_cameras[i].projection * point_3d;
            if projected[2].abs() < 1e-6 {
                max_reproj_err = f32::MAX;
                break;
            }
            let u_proj = projected[0] / projected[2];
            let v_proj = projected[1] / projected[2];
            let (u_obs, v_obs) = valid_points[i];
            let err = ((u_proj - u_obs).powi(2) + (v_proj - v_obs).powi(2)).sqrt();
            max_reproj_err = max_reproj_err.max(err);
        }

        if max_reproj_err < MAX_REPROJ_ERROR {
            kps3d[[kp_idx, 0]] = x;
            kps3d[[kp_idx, 1]] = y;
            kps3d[[kp_idx, 2]] = z;
            kps3d[[kp_idx, 3]] = conf_sum / valid_cameras.len() as f32;
        }
    }

    kps3d
}

use anyhow::{bail, Result};
use ndarray::{Array2, Array3};
use std::collections::HashMap;

/// キーポイント規約: 関節インデックス→名前の対応とPAF接続定義
#[derive(Debug)]
pub struct KeypointConvention {
    pub name: &'static str,
    pub joint_names: &'static [&'static str],
    /// PAF接続 (関節a, 関節b)。pafs[i] は joints[a] × joints[b] のスコア行列
    pub paf_pairs: &'static [(usize, usize)],
}

const COCO_NAMES: &[&str] = &[
    "nose",
    "left_eye",
    "right_eye",
    "left_ear",
    "right_ear",
    "left_shoulder",
    "right_shoulder",
    "left_elbow",
    "right_elbow",
    "left_wrist",
    "right_wrist",
    "left_hip",
    "right_hip",
    "left_knee",
    "right_knee",
    "left_ankle",
    "right_ankle",
];

const COCO_PAF: &[(usize, usize)] = &[
    (0, 1),
    (0, 2),
    (1, 3),
    (2, 4),
    (3, 5),
    (4, 6),
    (5, 6),
    (5, 7),
    (6, 8),
    (7, 9),
    (8, 10),
    (5, 11),
    (6, 12),
    (11, 12),
    (11, 13),
    (12, 14),
    (13, 15),
    (14, 16),
];

const OPENPOSE_25_NAMES: &[&str] = &[
    "nose",
    "neck",
    "right_shoulder",
    "right_elbow",
    "right_wrist",
    "left_shoulder",
    "left_elbow",
    "left_wrist",
    "mid_hip",
    "right_hip",
    "right_knee",
    "right_ankle",
    "left_hip",
    "left_knee",
    "left_ankle",
    "right_eye",
    "left_eye",
    "right_ear",
    "left_ear",
    "left_big_toe",
    "left_small_toe",
    "left_heel",
    "right_big_toe",
    "right_small_toe",
    "right_heel",
];

const OPENPOSE_25_PAF: &[(usize, usize)] = &[
    (1, 8),
    (9, 10),
    (10, 11),
    (8, 9),
    (8, 12),
    (12, 13),
    (13, 14),
    (1, 2),
    (2, 3),
    (3, 4),
    (2, 17),
    (1, 5),
    (5, 6),
    (6, 7),
    (5, 18),
    (1, 0),
    (0, 15),
    (0, 16),
    (15, 17),
    (16, 18),
    (14, 19),
    (19, 20),
    (14, 21),
    (11, 22),
    (22, 23),
    (11, 24),
];

const FOURDAG_19_NAMES: &[&str] = &[
    "mid_hip",
    "neck",
    "right_hip",
    "left_hip",
    "nose",
    "left_shoulder",
    "right_shoulder",
    "right_knee",
    "left_knee",
    "left_ear",
    "right_ear",
    "left_elbow",
    "right_elbow",
    "right_ankle",
    "left_ankle",
    "left_wrist",
    "right_wrist",
    "left_foot",
    "right_foot",
];

const FOURDAG_19_PAF: &[(usize, usize)] = &[
    (1, 0),
    (2, 7),
    (7, 13),
    (0, 2),
    (0, 3),
    (3, 8),
    (8, 14),
    (1, 5),
    (5, 11),
    (11, 15),
    (5, 9),
    (1, 6),
    (6, 12),
    (12, 16),
    (6, 10),
    (1, 4),
    (14, 17),
    (13, 18),
];

const MEDIAPIPE_BODY_NAMES: &[&str] = &[
    "nose",
    "left_eye_inner",
    "left_eye",
    "left_eye_outer",
    "right_eye_inner",
    "right_eye",
    "right_eye_outer",
    "left_ear",
    "right_ear",
    "mouth_left",
    "mouth_right",
    "left_shoulder",
    "right_shoulder",
    "left_elbow",
    "right_elbow",
    "left_wrist",
    "right_wrist",
    "left_pinky",
    "right_pinky",
    "left_index",
    "right_index",
    "left_thumb",
    "right_thumb",
    "left_hip",
    "right_hip",
    "left_knee",
    "right_knee",
    "left_ankle",
    "right_ankle",
    "left_heel",
    "right_heel",
    "left_foot_index",
    "right_foot_index",
];

const MEDIAPIPE_BODY_PAF: &[(usize, usize)] = &[
    (0, 2),
    (0, 5),
    (2, 7),
    (5, 8),
    (9, 10),
    (11, 12),
    (11, 13),
    (13, 15),
    (12, 14),
    (14, 16),
    (11, 23),
    (12, 24),
    (23, 24),
    (23, 25),
    (25, 27),
    (24, 26),
    (26, 28),
    (27, 29),
    (29, 31),
    (28, 30),
    (30, 32),
];

const CONVENTIONS: &[KeypointConvention] = &[
    KeypointConvention {
        name: "coco",
        joint_names: COCO_NAMES,
        paf_pairs: COCO_PAF,
    },
    KeypointConvention {
        name: "openpose_25",
        joint_names: OPENPOSE_25_NAMES,
        paf_pairs: OPENPOSE_25_PAF,
    },
    KeypointConvention {
        name: "fourdag_19",
        joint_names: FOURDAG_19_NAMES,
        paf_pairs: FOURDAG_19_PAF,
    },
    KeypointConvention {
        name: "mediapipe_body",
        joint_names: MEDIAPIPE_BODY_NAMES,
        paf_pairs: MEDIAPIPE_BODY_PAF,
    },
];

/// 近似マッピングで同一視する関節名グループ
const APPROXIMATE_ALIASES: &[&[&str]] = &[
    &["mid_hip", "pelvis"],
    &["left_foot", "left_big_toe", "left_foot_index"],
    &["right_foot", "right_big_toe", "right_foot_index"],
    &["left_eye", "left_eye_inner"],
    &["right_eye", "right_eye_inner"],
];

pub fn get_convention(name: &str) -> Result<&'static KeypointConvention> {
    CONVENTIONS
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| anyhow::anyhow!("Unknown keypoints convention: {}", name))
}

pub fn get_keypoint_num(name: &str) -> Result<usize> {
    Ok(get_convention(name)?.joint_names.len())
}

fn alias_match(a: &str, b: &str) -> bool {
    APPROXIMATE_ALIASES
        .iter()
        .any(|group| group.contains(&a) && group.contains(&b))
}

/// 変換先の各関節に対応する変換元インデックスを求める
///
/// 完全一致を優先し、approximate時のみエイリアス表を参照する。
/// 対応が無い関節は None。
pub fn mapping(src: &str, dst: &str, approximate: bool) -> Result<Vec<Option<usize>>> {
    let src_conv = get_convention(src)?;
    let dst_conv = get_convention(dst)?;

    let map = dst_conv
        .joint_names
        .iter()
        .map(|dst_name| {
            let exact = src_conv.joint_names.iter().position(|s| s == dst_name);
            if exact.is_some() || !approximate {
                return exact;
            }
            src_conv
                .joint_names
                .iter()
                .position(|s| alias_match(s, dst_name))
        })
        .collect();
    Ok(map)
}

/// 単一ビュー・単一フレームのbottom-up検出
///
/// joints[j] は関節jの候補点 (n_candidate, 3) — 各行 [x, y, score]。
/// pafs[p] は接続pの候補間スコア行列 (n_cand_a, n_cand_b)。
#[derive(Debug, Clone, Default)]
pub struct BottomUpDetection {
    pub joints: Vec<Array2<f32>>,
    pub pafs: Vec<Array2<f32>>,
}

/// bottom-up検出列を別のキーポイント規約へ変換する
///
/// - 対応関節が無い場合は空の候補集合 (0, 3)
/// - 対応PAFが無い場合は候補数に合わせたゼロ行列
/// - 変換元で逆向きに定義されたPAFは転置して流用
pub fn convert_bottom_up_kps_paf(
    frames: &[BottomUpDetection],
    src: &str,
    dst: &str,
    approximate: bool,
) -> Result<Vec<BottomUpDetection>> {
    let src_conv = get_convention(src)?;
    let dst_conv = get_convention(dst)?;
    let map = mapping(src, dst, approximate)?;

    // 変換元PAFの (a, b) → インデックス表
    let mut src_paf_index: HashMap<(usize, usize), usize> = HashMap::new();
    for (idx, &pair) in src_conv.paf_pairs.iter().enumerate() {
        src_paf_index.insert(pair, idx);
    }

    let mut converted = Vec::with_capacity(frames.len());
    for (frame_idx, frame) in frames.iter().enumerate() {
        if frame.joints.len() != src_conv.joint_names.len() {
            bail!(
                "Frame {}: expected {} joint lists for convention {}, got {}",
                frame_idx,
                src_conv.joint_names.len(),
                src,
                frame.joints.len()
            );
        }
        if frame.pafs.len() != src_conv.paf_pairs.len() {
            bail!(
                "Frame {}: expected {} paf matrices for convention {}, got {}",
                frame_idx,
                src_conv.paf_pairs.len(),
                src,
                frame.pafs.len()
            );
        }

        let joints: Vec<Array2<f32>> = map
            .iter()
            .map(|m| match m {
                Some(src_idx) => frame.joints[*src_idx].clone(),
                None => Array2::zeros((0, 3)),
            })
            .collect();

        let pafs: Vec<Array2<f32>> = dst_conv
            .paf_pairs
            .iter()
            .map(|&(a, b)| {
                let fallback = Array2::zeros((joints[a].nrows(), joints[b].nrows()));
                let (Some(sa), Some(sb)) = (map[a], map[b]) else {
                    return fallback;
                };
                if let Some(&idx) = src_paf_index.get(&(sa, sb)) {
                    frame.pafs[idx].clone()
                } else if let Some(&idx) = src_paf_index.get(&(sb, sa)) {
                    frame.pafs[idx].t().to_owned()
                } else {
                    fallback
                }
            })
            .collect();

        converted.push(BottomUpDetection { joints, pafs });
    }
    Ok(converted)
}

/// (n_person, n_kps, 4) のGT 3Dキーポイントを別規約へ変換する
///
/// 対応の無い関節は全ゼロ行（confidence 0 = 無効）になる。
pub fn convert_kps3d(
    kps3d: &Array3<f32>,
    src: &str,
    dst: &str,
    approximate: bool,
) -> Result<Array3<f32>> {
    let n_src = get_keypoint_num(src)?;
    let n_dst = get_keypoint_num(dst)?;
    if kps3d.shape()[1] != n_src {
        bail!(
            "kps3d has {} keypoints but convention {} defines {}",
            kps3d.shape()[1],
            src,
            n_src
        );
    }

    let map = mapping(src, dst, approximate)?;
    let n_person = kps3d.shape()[0];
    let mut out = Array3::<f32>::zeros((n_person, n_dst, 4));
    for person in 0..n_person {
        for (dst_idx, m) in map.iter().enumerate() {
            if let Some(src_idx) = m {
                for c in 0..4 {
                    out[[person, dst_idx, c]] = kps3d[[person, *src_idx, c]];
                }
            }
        }
    }
    Ok(out)
}

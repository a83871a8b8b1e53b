use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    /// 元データセットのルートパス（画像リストの相対パス基準）
    #[serde(default = "default_data_root")]
    pub data_root: String,
    /// データコンバータが出力したメタデータディレクトリ
    #[serde(default = "default_meta_path")]
    pub meta_path: String,
    /// 2D検出を変換する先のキーポイント規約
    #[serde(default = "default_kps2d_convention")]
    pub kps2d_convention: String,
    /// GT 3Dキーポイントの変換先規約（Noneならメタデータのまま）
    #[serde(default)]
    pub gt_kps3d_convention: Option<String>,
    /// GTとカメラ並進の距離単位 ("meter" / "centimeter" / "millimeter")
    #[serde(default = "default_metric_unit")]
    pub metric_unit: String,
    /// シャッフル済みフレームを読む場合true（end_of_clipは常にfalse）
    #[serde(default)]
    pub shuffled: bool,
    /// 返す外部パラメータの方向（true: world→cam）
    #[serde(default)]
    pub cam_world2cam: bool,
    /// 返す内部パラメータ行列の次元（3または4）
    #[serde(default = "default_cam_k_dim")]
    pub cam_k_dim: usize,
    /// 画像リサイズ [width, height]（Noneなら原寸）
    #[serde(default)]
    pub img_resize: Option<[u32; 2]>,
}

fn default_data_root() -> String { "data".to_string() }
fn default_meta_path() -> String { "mocap_meta".to_string() }
fn default_kps2d_convention() -> String { "fourdag_19".to_string() }
fn default_metric_unit() -> String { "meter".to_string() }
fn default_cam_k_dim() -> usize { 3 }

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            meta_path: default_meta_path(),
            kps2d_convention: default_kps2d_convention(),
            gt_kps3d_convention: None,
            metric_unit: default_metric_unit(),
            shuffled: false,
            cam_world2cam: false,
            cam_k_dim: default_cam_k_dim(),
            img_resize: None,
        }
    }
}

impl DatasetConfig {
    /// メートル基準からの単位換算係数
    pub fn metric_scale(&self) -> Result<f32> {
        match self.metric_unit.as_str() {
            "meter" => Ok(1.0),
            "centimeter" => Ok(100.0),
            "millimeter" => Ok(1000.0),
            other => bail!("Unknown metric unit: {}", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EstimatorConfig {
    /// ランドマークONNXモデルのパス
    #[serde(default = "default_model_path")]
    pub model_path: String,
    #[serde(default = "default_input_size")]
    pub input_width: i32,
    #[serde(default = "default_input_size")]
    pub input_height: i32,
    /// モデル入力テンソル名
    #[serde(default = "default_input_name")]
    pub input_name: String,
    /// モデル出力テンソル名（形状 [1, n_kps, 3]）
    #[serde(default = "default_output_name")]
    pub output_name: String,
    /// モデル出力のキーポイント規約
    #[serde(default = "default_estimator_convention")]
    pub convention: String,
    /// BBoxスコア閾値（以下のBBoxは推論しない）
    #[serde(default)]
    pub bbox_thr: f32,
    /// 平均visibilityがこの値以下なら検出なし扱い
    #[serde(default)]
    pub presence_thr: f32,
    /// 一括推論時に同時に読み込むフレーム数（Noneなら全フレーム）
    #[serde(default)]
    pub load_batch_size: Option<usize>,
}

fn default_model_path() -> String { "models/landmark.onnx".to_string() }
fn default_input_size() -> i32 { 256 }
fn default_input_name() -> String { "input".to_string() }
fn default_output_name() -> String { "landmarks".to_string() }
fn default_estimator_convention() -> String { "mediapipe_body".to_string() }

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            input_width: default_input_size(),
            input_height: default_input_size(),
            input_name: default_input_name(),
            output_name: default_output_name(),
            convention: default_estimator_convention(),
            bbox_thr: 0.0,
            presence_thr: 0.0,
            load_batch_size: None,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config {}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// 設定ファイルが無い・壊れている場合はデフォルトにフォールバック
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load(path).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.dataset.kps2d_convention, "fourdag_19");
        assert_eq!(config.dataset.cam_k_dim, 3);
        assert!(!config.dataset.cam_world2cam);
        assert_eq!(config.estimator.convention, "mediapipe_body");
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
            [dataset]
            data_root = "/data/shelf"
            metric_unit = "centimeter"

            [estimator]
            bbox_thr = 0.3
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.dataset.data_root, "/data/shelf");
        assert_eq!(config.dataset.metric_scale().unwrap(), 100.0);
        // 未指定フィールドはデフォルト
        assert_eq!(config.dataset.meta_path, "mocap_meta");
        assert_eq!(config.estimator.bbox_thr, 0.3);
        assert_eq!(config.estimator.input_width, 256);
    }

    #[test]
    fn test_metric_scale_unknown_unit() {
        let mut config = DatasetConfig::default();
        config.metric_unit = "inch".to_string();
        assert!(config.metric_scale().is_err());
    }
}

//! モデル操作の境界を定義するモジュール
//!
//! 学習・書き出し・推論の3操作を [`Yolo`] トレイトとして切り出します。
//! ドライバはこのトレイトにのみ依存するため、実際の学習を走らせずに
//! 設定値の受け渡しを検証できます。

use std::path::PathBuf;

use anyhow::Result;

use crate::detection_result::DetectionData;

/// 学習の設定
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    /// データセット記述ファイル (`data.yaml`) のパス
    pub data: PathBuf,
    /// エポック数
    pub epochs: usize,
    /// モデル入力の一辺の長さ
    pub imgsz: u32,
    /// バッチサイズ
    pub batch: usize,
    /// 学習結果の出力先のルートディレクトリ
    pub project: PathBuf,
    /// 学習結果の名前 (`<project>/<name>/` 以下に出力)
    pub name: String,
    /// ベースの重みを事前学習済みの初期値として使うかどうか
    pub pretrained: bool,
    /// 学習率
    pub lr: f64,
}

/// 推論の設定
#[derive(Debug, Clone, PartialEq)]
pub struct PredictConfig {
    /// 入力画像のパス
    pub source: PathBuf,
    /// コンフィデンスの閾値
    pub conf: f32,
    /// 検出結果を描画した画像を出力するかどうか
    pub show: bool,
}

/// 学習済みモデルの書き出し形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// safetensors形式 (学習フレームワーク外でも読める持ち運び用の形式)
    SafeTensors,
}

/// 学習結果のサマリ
#[derive(Debug, Clone)]
pub struct TrainReport {
    /// 実行したエポック数
    pub epochs_run: usize,
    /// 最終エポックの平均ロス
    pub final_loss: f32,
    /// 最良エポックの平均ロス
    pub best_loss: f32,
    /// 学習結果の出力ディレクトリ
    pub run_dir: PathBuf,
    /// 最良チェックポイントのパス
    pub best_weights: PathBuf,
}

/// 推論結果
#[derive(Debug, Clone)]
pub struct Prediction {
    /// 検出された物体 (元の画像の座標系)
    pub detections: Vec<DetectionData>,
    /// 検出結果を描画した画像のパス (`show` が無効の場合はNone)
    pub overlay: Option<PathBuf>,
}

/// 検出モデルの操作
pub trait Yolo {
    /// モデルを学習します。
    fn train(&mut self, cfg: &TrainConfig) -> Result<TrainReport>;

    /// 学習済みの重みを指定した形式で書き出し、出力先のパスを返します。
    fn export(&mut self, format: ExportFormat) -> Result<PathBuf>;

    /// 1枚の画像に対して推論を実行します。
    fn predict(&mut self, cfg: &PredictConfig) -> Result<Prediction>;
}

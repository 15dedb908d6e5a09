//! 固定設定でモデル操作を起動するドライバモジュール
//!
//! 学習・推論のパラメータはすべてここに定数として埋め込まれています。
//! コマンドライン引数や環境変数による上書きはありません。

use std::path::PathBuf;

use anyhow::Result;

use crate::engine::{ExportFormat, PredictConfig, Prediction, TrainConfig, TrainReport, Yolo};

/// ベースのチェックポイント
pub const BASE_WEIGHTS: &str = "yolov8n.tar.gz";
/// 学習で得られる最良チェックポイント
pub const BEST_WEIGHTS: &str = "runs/detect/fish_yolov8_tiny/weights/best.tar.gz";
/// 推論に使うテスト画像
pub const TEST_IMAGE: &str = "test_fish.jpg";

/// 魚種データセットに対する学習と書き出しを実行します。
///
/// # Args
/// * `model` - 学習対象のモデル
///
/// # Return
/// * 学習のサマリと、書き出されたモデルのパス
pub fn run_training(model: &mut dyn Yolo) -> Result<(TrainReport, PathBuf)> {
    let report = model.train(&TrainConfig {
        data: PathBuf::from("data.yaml"),
        epochs: 50,
        imgsz: 640,
        batch: 16,
        project: PathBuf::from("runs/detect"),
        name: "fish_yolov8_tiny".to_string(),
        pretrained: true,
        lr: 1e-3,
    })?;

    // モバイル・エッジ向けに学習済みモデルを書き出す
    let exported = model.export(ExportFormat::SafeTensors)?;
    Ok((report, exported))
}

/// テスト画像1枚に対する推論を実行します。
///
/// # Args
/// * `model` - 学習済みのモデル
///
/// # Return
/// * 検出結果
pub fn run_prediction(model: &mut dyn Yolo) -> Result<Prediction> {
    model.predict(&PredictConfig {
        source: PathBuf::from(TEST_IMAGE),
        conf: 0.5,
        show: true,
    })
}

//! # YOLOv8 魚種検出ライブラリ
//!
//! このクレートは、魚種データセット向けのYOLOv8系検出モデルを学習・推論するためのRustライブラリです。
//!
//! ## 主な機能
//!
//! 1. **モデルの学習**: データセット記述ファイル (`data.yaml`) を読み込み、固定設定で学習を実行します。
//! 2. **学習済みモデルの書き出し**: 学習後の重みをsafetensors形式に書き出します。
//! 3. **画像の物体検出**: 学習済みチェックポイントを使用して画像から魚を検出します。
//! 4. **後処理**: モデルの出力を人間が理解しやすい形式に変換し、検出結果を画像に描画します。
//!
//! ## Example
//! ```no_run
//! use yolo_v8_fish::driver;
//! use yolo_v8_fish::yolov8_fish::YoloV8Fish;
//!
//! # fn main() -> anyhow::Result<()> {
//! // ベースのチェックポイントからモデルを構築し、学習と書き出しを実行
//! let mut model = YoloV8Fish::new("yolov8n.tar.gz")?;
//! let (report, exported) = driver::run_training(&mut model)?;
//! println!("best: {}", report.best_weights.display());
//! println!("exported: {}", exported.display());
//! # Ok(())
//! # }
//! ```

pub mod dataset;
pub mod detection_result;
pub mod driver;
pub mod engine;
pub mod export;
pub mod img_proc;
pub mod model;
pub mod postprocess;
pub mod trainer;
pub mod yolov8_fish;

mod nms;

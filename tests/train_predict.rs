//! 合成データセットでの学習から推論までのスモークテスト

use std::fs;
use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use yolo_v8_fish::engine::{ExportFormat, PredictConfig, TrainConfig, Yolo};
use yolo_v8_fish::yolov8_fish::{ModelMeta, YoloV8Fish};

/// 単色の背景に魚に見立てた矩形を1つ描いた画像と、そのラベルを作成する
fn write_sample(images: &Path, labels: &Path, stem: &str, class: usize) {
    let mut img = RgbImage::from_pixel(64, 64, Rgb([30, 60, 120]));
    for y in 24..40 {
        for x in 16..48 {
            img.put_pixel(x, y, Rgb([220, 180, 40]));
        }
    }
    img.save(images.join(format!("{stem}.png"))).unwrap();

    // 中心 (0.5, 0.5), 幅 0.5, 高さ 0.25
    fs::write(
        labels.join(format!("{stem}.txt")),
        format!("{class} 0.5 0.5 0.5 0.25\n"),
    )
    .unwrap();
}

/// 一時ディレクトリに data.yaml・画像・ラベルを持つデータセットを作る
fn synthetic_dataset(root: &Path) -> PathBuf {
    let images = root.join("images");
    let labels = root.join("labels");
    fs::create_dir_all(&images).unwrap();
    fs::create_dir_all(&labels).unwrap();

    write_sample(&images, &labels, "fish_000", 0);
    write_sample(&images, &labels, "fish_001", 1);

    let descriptor = root.join("data.yaml");
    fs::write(&descriptor, "train: images\nnames: [bangus, tilapia]\n").unwrap();
    descriptor
}

fn train_config(data: PathBuf, project: PathBuf) -> TrainConfig {
    TrainConfig {
        data,
        epochs: 1,
        imgsz: 64,
        batch: 2,
        project,
        name: "smoke".to_string(),
        pretrained: true,
        lr: 1e-3,
    }
}

#[test]
fn train_export_predict_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = synthetic_dataset(dir.path());
    let project = dir.path().join("runs");

    // ベースのチェックポイントを用意して読み込む
    let base_path = dir.path().join("base.tar.gz");
    YoloV8Fish::untrained(ModelMeta {
        names: vec!["bangus".to_string(), "tilapia".to_string()],
        imgsz: 64,
    })
    .save_checkpoint(&base_path)
    .unwrap();
    let mut model = YoloV8Fish::new(&base_path).unwrap();

    // 学習
    let report = model
        .train(&train_config(descriptor, project.clone()))
        .unwrap();
    assert_eq!(report.epochs_run, 1);
    assert!(report.best_weights.is_file());
    assert!(project.join("smoke/weights/last.tar.gz").is_file());

    // 書き出しは学習結果の weights/ に置かれる
    let exported = model.export(ExportFormat::SafeTensors).unwrap();
    assert_eq!(exported, project.join("smoke/weights/best.safetensors"));
    assert!(exported.is_file());

    // 最良チェックポイントを読み直して推論 (閾値0で少なくとも落ちないこと)
    let mut best = YoloV8Fish::new(&report.best_weights).unwrap();
    let prediction = best
        .predict(&PredictConfig {
            source: dir.path().join("images/fish_000.png"),
            conf: 0.99,
            show: false,
        })
        .unwrap();
    assert!(prediction.overlay.is_none());
    for d in &prediction.detections {
        assert!(d.confidence > 0.99);
        assert!(d.class < 2);
    }
}

#[test]
fn training_fails_on_class_count_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let descriptor = synthetic_dataset(dir.path());

    // ベースは1クラスしか知らない
    let mut model = YoloV8Fish::untrained(ModelMeta {
        names: vec!["bangus".to_string()],
        imgsz: 64,
    });
    let err = model
        .train(&train_config(descriptor, dir.path().join("runs")))
        .unwrap_err();
    assert!(err.to_string().contains("classes"));
}

#[test]
fn training_fails_on_missing_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = YoloV8Fish::untrained(ModelMeta {
        names: vec!["bangus".to_string()],
        imgsz: 64,
    });
    let cfg = train_config(dir.path().join("no_such.yaml"), dir.path().join("runs"));
    assert!(model.train(&cfg).is_err());
}

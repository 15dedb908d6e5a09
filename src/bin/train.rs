use anyhow::Result;

use yolo_v8_fish::driver;
use yolo_v8_fish::yolov8_fish::YoloV8Fish;

fn main() -> Result<()> {
    // ベースのチェックポイントからモデルを構築
    let mut model = YoloV8Fish::new(driver::BASE_WEIGHTS)?;

    // 魚種データセットで学習し、学習済みモデルを書き出す
    let (report, exported) = driver::run_training(&mut model)?;

    println!(
        "finished {} epochs (best loss {:.4}, final loss {:.4})",
        report.epochs_run, report.best_loss, report.final_loss
    );
    println!("weights: {}", report.best_weights.display());
    println!("exported: {}", exported.display());

    Ok(())
}

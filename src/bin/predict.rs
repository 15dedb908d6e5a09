use anyhow::Result;
use std::time::Instant;

use yolo_v8_fish::driver;
use yolo_v8_fish::yolov8_fish::YoloV8Fish;

fn main() -> Result<()> {
    // 学習で得られた最良チェックポイントからモデルを構築
    let mut model = YoloV8Fish::new(driver::BEST_WEIGHTS)?;

    let start = Instant::now();

    // テスト画像に対して推論を実行
    let prediction = driver::run_prediction(&mut model)?;

    let end = start.elapsed();
    let t = end.as_secs_f64() * 1000.0;
    println!("{:?}", prediction.detections);
    println!("Processing time:{:.03}ms, {:.1}FPS", t, 1000. / t);

    if let Some(overlay) = prediction.overlay {
        println!("overlay: {}", overlay.display());
    }

    Ok(())
}

//! 検出モデルの出力を後処理するためのモジュール

use crate::detection_result::DetectionData;
use crate::model;
use crate::nms::nms_process;

/// `post_process`関数は、検出ヘッドの出力から物体検出を行います
///
/// # Args
/// * `raw` - 検出ヘッドの出力 (チャネル優先の `[5 + cls_num, S, S]`, `S = imgsz / 32`)
/// * `cls_num` - クラスの数
/// * `imgsz` - モデル入力の一辺の長さ
/// * `conf_threshold` - 物体検出の閾値
/// * `nms_threshold` - 非最大抑制（NMS）の閾値
///
/// # Return
/// * 検出された物体を表すDetectionDataのベクトル
///
/// 各DetectionDataは、検出された物体のクラスID、コンフィデンス、
/// およびレターボックス画像の座標系でのバウンディングボックスを含みます
pub fn post_process(
    raw: &[f32],
    cls_num: usize,
    imgsz: u32,
    conf_threshold: f32,
    nms_threshold: f32,
) -> Vec<DetectionData> {
    if cls_num == 0 {
        return vec![];
    }

    let grid = model::grid_size(imgsz);
    let plane = grid * grid;
    let stride = imgsz as f32 / grid as f32;
    debug_assert_eq!(raw.len(), (model::BOX_CHANNELS + cls_num) * plane);

    let mut boxes: Vec<DetectionData> = Vec::new();
    for gy in 0..grid {
        for gx in 0..grid {
            let cell = gy * grid + gx;

            // (中心x, 中心y) はセル内オフセット、(幅, 高さ) は入力画像に対する比率
            let px = raw[cell];
            let py = raw[plane + cell];
            let pw = raw[2 * plane + cell];
            let ph = raw[3 * plane + cell];
            let obj = raw[4 * plane + cell];

            // クラススコアが最大のクラスを採用
            let (cls_id, cls_score) = (0..cls_num)
                .map(|c| (c, raw[(model::BOX_CHANNELS + c) * plane + cell]))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .expect("cls_num is non-zero");

            let confidence = obj * cls_score;
            if confidence <= conf_threshold {
                continue;
            }

            let cx = (gx as f32 + px) * stride;
            let cy = (gy as f32 + py) * stride;
            let cw = pw * imgsz as f32;
            let ch = ph * imgsz as f32;

            if let Ok(d) =
                DetectionData::from_cell(cx, cy, cw, ch, confidence, cls_id, imgsz as f32)
            {
                boxes.push(d);
            }
        }
    }

    // NMS を適用
    nms_process(&boxes, cls_num, conf_threshold, nms_threshold)
}

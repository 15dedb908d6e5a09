use crate::detection_result::DetectionData;

fn iou(a: &DetectionData, b: &DetectionData) -> f32 {
    let x1 = f32::max(a.x1, b.x1);
    let y1 = f32::max(a.y1, b.y1);
    let x2 = f32::min(a.x2, b.x2);
    let y2 = f32::min(a.y2, b.y2);

    if x1 >= x2 || y1 >= y2 {
        return 0.0;
    }
    let inter = (x2 - x1) * (y2 - y1);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    inter / (area_a + area_b - inter)
}

fn nms(bb: &[DetectionData], nms_threshold: f32) -> Vec<DetectionData> {
    let mut sorted_bb = bb.to_vec();
    sorted_bb.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<DetectionData> = Vec::with_capacity(sorted_bb.len());
    for d in sorted_bb {
        if keep.iter().all(|k| iou(k, &d) <= nms_threshold) {
            keep.push(d);
        }
    }
    keep
}

pub fn nms_process(
    bb: &[DetectionData],
    cls_num: usize,
    conf_threshold: f32,
    nms_threshold: f32,
) -> Vec<DetectionData> {
    // クラス別に分割
    let mut cls: Vec<Vec<DetectionData>> = vec![vec![]; cls_num];
    for &detection in bb {
        if detection.confidence > conf_threshold && detection.confidence <= 1.0 {
            cls[detection.class].push(detection);
        }
    }

    // 各クラスに Non-Maximum Suppression (NMS) を適用し，重なっているBBoxの中でコンフィデンスが最大のものを集める
    cls.into_iter()
        .flat_map(|d| nms(&d, nms_threshold))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(class: usize, x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> DetectionData {
        DetectionData {
            class,
            x1,
            y1,
            x2,
            y2,
            confidence,
        }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = boxed(0, 0., 0., 10., 10., 0.9);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = boxed(0, 0., 0., 10., 10., 0.9);
        let b = boxed(0, 20., 20., 30., 30., 0.9);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn overlapping_boxes_keep_highest_confidence() {
        let a = boxed(0, 0., 0., 10., 10., 0.9);
        let b = boxed(0, 1., 1., 11., 11., 0.6);
        let kept = nms_process(&[a, b], 1, 0.5, 0.45);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn suppression_is_per_class() {
        let a = boxed(0, 0., 0., 10., 10., 0.9);
        let b = boxed(1, 0., 0., 10., 10., 0.8);
        let kept = nms_process(&[a, b], 2, 0.5, 0.45);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn low_confidence_boxes_are_dropped() {
        let a = boxed(0, 0., 0., 10., 10., 0.3);
        assert!(nms_process(&[a], 1, 0.5, 0.45).is_empty());
    }
}

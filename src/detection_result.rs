//! 物体検出の結果を処理するモジュール

use anyhow::{anyhow, Result};

/// 検出された物体1つ分の情報を保持するための構造体
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionData {
    /// クラスID
    pub class: usize,
    /// バウンディングボックス左上のx
    pub x1: f32,
    /// バウンディングボックス左上のy
    pub y1: f32,
    /// バウンディングボックス右下のx
    pub x2: f32,
    /// バウンディングボックス右下のy
    pub y2: f32,
    /// コンフィデンス
    pub confidence: f32,
}

impl DetectionData {
    /// グリッドセルのデコード結果から新しいDetectionDataを作成します。
    ///
    /// # Args
    ///
    /// * `cx`, `cy` - バウンディングボックス中心の座標 (レターボックス画像の座標系)
    /// * `cw`, `ch` - バウンディングボックスの幅と高さ
    /// * `confidence` - コンフィデンス
    /// * `cls_id` - クラスID
    /// * `imgsz` - モデル入力の一辺の長さ
    ///
    /// # Return
    /// * 新たなDetectionDataインスタンス (座標は `0..imgsz` に切り詰められます)
    pub fn from_cell(
        cx: f32,
        cy: f32,
        cw: f32,
        ch: f32,
        confidence: f32,
        cls_id: usize,
        imgsz: f32,
    ) -> Result<Self> {
        let values = [cx, cy, cw, ch, confidence];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("non-finite box values: {:?}", values));
        }

        Ok(Self {
            class: cls_id,
            x1: (cx - cw / 2.).clamp(0., imgsz),
            y1: (cy - ch / 2.).clamp(0., imgsz),
            x2: (cx + cw / 2.).clamp(0., imgsz),
            y2: (cy + ch / 2.).clamp(0., imgsz),
            confidence,
        })
    }

    /// モデルが出力した検出結果の座標を元の画像の座標系に戻します。
    ///
    /// # Args
    ///
    /// * `width` - 元の画像の幅
    /// * `height` - 元の画像の高さ
    /// * `imgsz` - モデル入力の一辺の長さ
    ///
    /// # Return
    /// * 新たなDetectionDataインスタンス
    pub fn reverse_transform(&self, width: u32, height: u32, imgsz: u32) -> Self {
        let mut new_d = *self;
        (new_d.x1, new_d.y1) = point_reverse_transform(width, height, imgsz, self.x1, self.y1);
        (new_d.x2, new_d.y2) = point_reverse_transform(width, height, imgsz, self.x2, self.y2);
        new_d
    }
}

/// レターボックス画像上の座標を元の画像の座標系に戻します。
///
/// # Args
///
/// * `width` - 元の画像の幅
/// * `height` - 元の画像の高さ
/// * `imgsz` - モデル入力の一辺の長さ
/// * `x` - x座標
/// * `y` - y座標
///
/// # Return
/// * 新たな座標 (x, y)
fn point_reverse_transform(width: u32, height: u32, imgsz: u32, x: f32, y: f32) -> (f32, f32) {
    let input_size = imgsz as f32;

    let wratio = input_size / width as f32;
    let hratio = input_size / height as f32;
    let ratio = f32::min(wratio, hratio);
    let nw = width as f32 * ratio;
    let nh = height as f32 * ratio;

    let pad_w = (input_size - nw) / 2.;
    let pad_h = (input_size - nh) / 2.;

    ((x - pad_w) / ratio, (y - pad_h) / ratio)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_cell_clamps_to_input_bounds() {
        let d = DetectionData::from_cell(10., 10., 40., 40., 0.9, 0, 640.).unwrap();
        assert_eq!(d.x1, 0.);
        assert_eq!(d.y1, 0.);
        assert_eq!(d.x2, 30.);
        assert_eq!(d.y2, 30.);
    }

    #[test]
    fn from_cell_rejects_non_finite_values() {
        assert!(DetectionData::from_cell(f32::NAN, 0., 1., 1., 0.5, 0, 640.).is_err());
    }

    #[test]
    fn reverse_transform_undoes_letterbox_padding() {
        // 1280x640 の画像は 640x320 に縮小され、上下に 160px のパディングが入る
        let d = DetectionData {
            class: 0,
            x1: 0.,
            y1: 160.,
            x2: 640.,
            y2: 480.,
            confidence: 1.,
        };
        let r = d.reverse_transform(1280, 640, 640);
        assert!((r.x1 - 0.).abs() < 1e-3);
        assert!((r.y1 - 0.).abs() < 1e-3);
        assert!((r.x2 - 1280.).abs() < 1e-3);
        assert!((r.y2 - 640.).abs() < 1e-3);
    }
}

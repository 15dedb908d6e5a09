//! 検出モデルに関する画像処理モジュール

use image::imageops::FilterType;
use image::{DynamicImage, Pixel, Rgb, RgbImage};

use crate::detection_result::DetectionData;

use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};

/// 画像のピクセルデータをCHW形式のバッファの指定した位置に配置します。
///
/// # Args
///
/// * `data` - 配置先のデータ (長さ `3 * size * size`, in-place)
/// * `img` - 配置する画像
/// * `size` - 配置先の画像の一辺の長さ
/// * `x_offset` - x軸方向のオフセット
/// * `y_offset` - y軸方向のオフセット
pub fn place_pixels(data: &mut [f32], img: &DynamicImage, size: u32, x_offset: u32, y_offset: u32) {
    let plane = (size * size) as usize;
    for (x, y, pixel) in img.to_rgb8().enumerate_pixels() {
        let idx = ((y + y_offset) * size + (x + x_offset)) as usize;
        data[idx] = f32::from(pixel[0]) / 255.;
        data[plane + idx] = f32::from(pixel[1]) / 255.;
        data[2 * plane + idx] = f32::from(pixel[2]) / 255.;
    }
}

/// 画像をアスペクト比を保ったままリサイズし、正方形に整形したモデル入力データを生成します。
///
/// # Args
///
/// * `img` - リサイズを行う画像
/// * `size` - リサイズ後の画像の一辺の長さ
///
/// # Return
///
/// * リサイズとパディングを行った画像のピクセルデータ (CHW形式, `0.0..=1.0`)
pub fn letterbox(img: &DynamicImage, size: u32) -> Vec<f32> {
    let resized = img.resize(size, size, FilterType::Nearest);

    let pad_w = resized.width().abs_diff(size) / 2;
    let pad_h = resized.height().abs_diff(size) / 2;

    let mut new_img = vec![0.; (size * size * 3) as usize];
    place_pixels(&mut new_img, &resized, size, pad_w, pad_h);
    new_img
}

const COLORS: [[u8; 3]; 10] = [
    [230, 57, 70],
    [244, 162, 97],
    [42, 157, 143],
    [38, 70, 83],
    [233, 196, 106],
    [106, 76, 147],
    [17, 138, 178],
    [239, 71, 111],
    [6, 214, 160],
    [7, 59, 76],
];

/// 画像上に矩形の枠を描画します。
///
/// # Args
///
/// * `img` - 矩形を描画する画像 (in-place)
/// * `x1`, `y1`, `x2`, `y2` - 矩形の左上と右下の座標
/// * `thickness` - 線の太さ
/// * `color` - 線の色
fn draw_rect(
    img: &mut RgbImage,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    thickness: u32,
    color: Rgb<u8>,
) {
    let w = (x2 - x1).max(1.) as u32;
    let h = (y2 - y1).max(1.) as u32;
    for t in 0..thickness {
        if w <= 2 * t || h <= 2 * t {
            break;
        }
        let rect = Rect::at((x1 as i32) + t as i32, (y1 as i32) + t as i32)
            .of_size(w - 2 * t, h - 2 * t);
        draw_hollow_rect_mut(img, rect, color);
    }
}

/// 画像上にラベルを描画します。
///
/// # Args
///
/// * `img` - ラベルを描画する画像 (in-place)
/// * `x1`, `y1` - ラベルを付ける矩形の左上の座標
/// * `bg_color` - ラベルの背景色
/// * `font` - ラベルのフォント
/// * `font_size` - ラベルのフォントサイズ
/// * `text` - ラベルに表示するテキスト
fn draw_label(
    img: &mut RgbImage,
    x1: f32,
    y1: f32,
    bg_color: Rgb<u8>,
    font: &Font,
    font_size: f32,
    text: &str,
) {
    let pad = 4.;
    let scale = Scale::uniform(font_size);
    let (text_w, _) = text_size(scale, font, text);

    // ラベルは矩形の上に出す。画像の上端からはみ出す場合は矩形の内側に出す
    let label_y = if y1 >= font_size { y1 - font_size } else { y1 };
    let rect = Rect::at(x1 as i32, label_y as i32)
        .of_size((text_w as f32 + pad * 2.) as u32, font_size as u32);
    draw_filled_rect_mut(img, rect, bg_color);

    // 背景が暗い場合は白文字にする
    let text_color = if (bg_color[0] as i32 + bg_color[1] as i32 + bg_color[2] as i32) < 382 {
        Rgb([255u8, 255, 255])
    } else {
        Rgb([0u8, 0, 0])
    };
    draw_text_mut(
        img,
        text_color,
        (x1 + pad) as i32,
        label_y as i32,
        scale,
        font,
        text,
    );
}

/// 画像上にバウンディングボックスとクラス名のラベルを描画します。
///
/// # Args
///
/// * `img` - バウンディングボックスとラベルを描画する画像 (in-place)
/// * `d_result` - 検出結果の配列
/// * `names` - クラス名の配列
/// * `font_size` - ラベルのフォントサイズ
/// * `line_thickness` - バウンディングボックスの線の太さ
pub fn draw_bbox(
    img: &mut RgbImage,
    d_result: &[DetectionData],
    names: &[String],
    font_size: f32,
    line_thickness: u32,
) {
    let font = Vec::from(include_bytes!("DejaVuSansMono.ttf") as &[u8]);
    let font = Font::try_from_vec(font).expect("bundled font is valid");

    // コンフィデンスの高い結果が最前面になるように描画
    let mut sorted = d_result.to_vec();
    sorted.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    for d in sorted.iter() {
        let color: Rgb<u8> = *Rgb::from_slice(&COLORS[d.class % COLORS.len()]);

        let x1 = d.x1.round();
        let y1 = d.y1.round();
        let x2 = d.x2.round();
        let y2 = d.y2.round();

        draw_rect(img, x1, y1, x2, y2, line_thickness, color);

        let text = match names.get(d.class) {
            Some(name) => format!("{}: {:.2}", name, d.confidence),
            None => format!("{}: {:.2}", d.class, d.confidence),
        };
        draw_label(img, x1, y1, color, &font, font_size, &text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letterbox_pads_wide_image_vertically() {
        // 4:1 の白画像。上下がゼロパディングされる
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 16, Rgb([255, 255, 255])));
        let data = letterbox(&img, 64);
        assert_eq!(data.len(), 3 * 64 * 64);

        // 上端はパディング、中央は画像本体
        assert_eq!(data[0], 0.);
        let center = (32 * 64 + 32) as usize;
        assert!((data[center] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn draw_bbox_uses_class_name_without_panicking() {
        let mut img = RgbImage::new(64, 64);
        let d = DetectionData {
            class: 0,
            x1: 8.,
            y1: 8.,
            x2: 40.,
            y2: 40.,
            confidence: 0.8,
        };
        draw_bbox(&mut img, &[d], &["tilapia".to_string()], 12., 2);
        // 枠の色が乗っていること
        assert_ne!(img.get_pixel(8, 20), &Rgb([0, 0, 0]));
    }
}

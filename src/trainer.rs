//! 学習ループを実装するモジュール

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use burn::nn::loss::{MseLoss, Reduction};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use log::{info, warn};

use crate::dataset::{DatasetDescriptor, Sample};
use crate::engine::TrainConfig;
use crate::img_proc;
use crate::model::{
    grid_size, model_from_bytes, record_to_bytes, FishNet, FishNetConfig, TrainBackend,
    BOX_CHANNELS,
};

/// 学習で得られた重みとロスのサマリ
pub struct TrainedWeights {
    /// 最終エポックの重み
    pub last: Vec<u8>,
    /// 最良エポックの重み
    pub best: Vec<u8>,
    /// 最終エポックの平均ロス
    pub final_loss: f32,
    /// 最良エポックの平均ロス
    pub best_loss: f32,
    /// 実行したエポック数
    pub epochs_run: usize,
}

/// 学習ループを実行します。
///
/// # Args
/// * `cfg` - 学習の設定
/// * `descriptor` - データセット記述
/// * `data_root` - 記述ファイルのあるディレクトリ
/// * `base_record` - 事前学習済みの初期値 (`pretrained` が有効な場合のみ使用)
///
/// # Return
/// * 学習で得られた重み
pub fn run_train(
    cfg: &TrainConfig,
    descriptor: &DatasetDescriptor,
    data_root: &Path,
    base_record: Option<Vec<u8>>,
) -> Result<TrainedWeights> {
    let samples = descriptor.train_samples(data_root)?;
    if samples.is_empty() {
        bail!("no training samples under {}", data_root.display());
    }
    let val_samples = descriptor.val_samples(data_root)?;

    let num_classes = descriptor.num_classes();
    let device = <TrainBackend as Backend>::Device::default();
    let mut model: FishNet<TrainBackend> =
        FishNet::new(FishNetConfig::new(num_classes), &device);

    if cfg.pretrained {
        match base_record {
            Some(bytes) => {
                model = model_from_bytes(FishNetConfig::new(num_classes), bytes, &device)
                    .context("failed to load pretrained weights")?;
            }
            None => warn!("pretrained requested but no base weights available"),
        }
    }

    info!(
        "training on {} samples ({} classes, imgsz {}, batch {})",
        samples.len(),
        num_classes,
        cfg.imgsz,
        cfg.batch
    );

    let mut optim = AdamConfig::new().init();
    let batch_size = cfg.batch.max(1);
    let loss_fn = MseLoss::new();

    let mut best: Option<(f32, Vec<u8>)> = None;
    let mut final_loss = 0.0;

    for epoch in 0..cfg.epochs {
        let mut losses = Vec::new();
        for chunk in samples.chunks(batch_size) {
            let (input, target, mask) = collate(chunk, cfg.imgsz, num_classes, &device)?;

            let pred = model.forward(input);
            let loss = loss_fn.forward(pred * mask.clone(), target * mask, Reduction::Mean);
            let loss_detached = loss.clone().detach();

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(cfg.lr, model, grads);

            let loss_val: f32 = loss_detached
                .into_data()
                .to_vec::<f32>()
                .unwrap_or_default()
                .into_iter()
                .next()
                .unwrap_or(0.0);
            losses.push(loss_val);
        }

        let avg_loss: f32 = if losses.is_empty() {
            0.0
        } else {
            losses.iter().sum::<f32>() / losses.len() as f32
        };

        // 検証セットがある場合は検証ロスで最良エポックを選ぶ
        let metric = match &val_samples {
            Some(val) if !val.is_empty() => {
                let val_loss =
                    evaluate(&model, val, cfg.imgsz, num_classes, batch_size, &device)?;
                info!(
                    "epoch {}/{}: train loss {:.4}, val loss {:.4}",
                    epoch + 1,
                    cfg.epochs,
                    avg_loss,
                    val_loss
                );
                val_loss
            }
            _ => {
                info!("epoch {}/{}: avg loss {:.4}", epoch + 1, cfg.epochs, avg_loss);
                avg_loss
            }
        };

        final_loss = metric;
        if best.as_ref().map_or(true, |(b, _)| metric < *b) {
            best = Some((metric, record_to_bytes(&model)?));
        }
    }

    let last = record_to_bytes(&model)?;
    let (best_loss, best) = match best {
        Some((loss, bytes)) => (loss, bytes),
        // エポック数0の場合は初期重みをそのまま返す
        None => (final_loss, last.clone()),
    };

    Ok(TrainedWeights {
        last,
        best,
        final_loss,
        best_loss,
        epochs_run: cfg.epochs,
    })
}

/// 検証セットの平均ロスを計算します。勾配の計算と重みの更新は行いません。
fn evaluate(
    model: &FishNet<TrainBackend>,
    samples: &[Sample],
    imgsz: u32,
    num_classes: usize,
    batch_size: usize,
    device: &<TrainBackend as Backend>::Device,
) -> Result<f32> {
    let loss_fn = MseLoss::new();
    let mut losses = Vec::new();
    for chunk in samples.chunks(batch_size) {
        let (input, target, mask) = collate(chunk, imgsz, num_classes, device)?;
        let pred = model.forward(input);
        let loss = loss_fn
            .forward(pred * mask.clone(), target * mask, Reduction::Mean)
            .detach();
        let loss_val: f32 = loss
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default()
            .into_iter()
            .next()
            .unwrap_or(0.0);
        losses.push(loss_val);
    }
    if losses.is_empty() {
        return Ok(0.0);
    }
    Ok(losses.iter().sum::<f32>() / losses.len() as f32)
}

/// サンプルのバッチをテンソルに変換します。
///
/// # Args
/// * `samples` - バッチに含めるサンプル
/// * `imgsz` - モデル入力の一辺の長さ
/// * `num_classes` - クラス数
/// * `device` - テンソルを配置するデバイス
///
/// # Return
/// * (入力 `[B, 3, imgsz, imgsz]`, ターゲット `[B, C, S, S]`, マスク `[B, C, S, S]`)
///
/// ターゲットはボックス中心が属するセルにのみ設定します。マスクは
/// objectnessチャネルが全セル1、ボックス・クラスチャネルは割り当てセルのみ1です。
fn collate<B: Backend>(
    samples: &[Sample],
    imgsz: u32,
    num_classes: usize,
    device: &B::Device,
) -> Result<(Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>)> {
    if samples.is_empty() {
        bail!("cannot collate empty batch");
    }

    let batch = samples.len();
    let size = imgsz as usize;
    let grid = grid_size(imgsz);
    let plane = grid * grid;
    let channels = BOX_CHANNELS + num_classes;
    let stride = imgsz as f32 / grid as f32;

    let mut image_buf: Vec<f32> = Vec::with_capacity(batch * 3 * size * size);
    let mut target_buf = vec![0f32; batch * channels * plane];
    let mut mask_buf = vec![0f32; batch * channels * plane];

    for (sample_idx, sample) in samples.iter().enumerate() {
        let img = image::open(&sample.image)
            .map_err(|e| anyhow!("failed to open image {}: {e}", sample.image.display()))?;
        let (width, height) = (img.width() as f32, img.height() as f32);
        image_buf.extend(img_proc::letterbox(&img, imgsz));

        // レターボックス変換のパラメータ
        let ratio = f32::min(imgsz as f32 / width, imgsz as f32 / height);
        let pad_w = (imgsz as f32 - width * ratio) / 2.;
        let pad_h = (imgsz as f32 - height * ratio) / 2.;

        let base = sample_idx * channels * plane;

        // objectnessは全セルが学習対象
        for cell in 0..plane {
            mask_buf[base + 4 * plane + cell] = 1.;
        }

        for b in &sample.boxes {
            // ラベルをレターボックス画像の座標系に変換
            let cx = b.cx * width * ratio + pad_w;
            let cy = b.cy * height * ratio + pad_h;
            let bw = b.w * width * ratio;
            let bh = b.h * height * ratio;

            let gx = ((cx / stride) as usize).min(grid - 1);
            let gy = ((cy / stride) as usize).min(grid - 1);
            let cell = gy * grid + gx;

            target_buf[base + cell] = cx / stride - gx as f32;
            target_buf[base + plane + cell] = cy / stride - gy as f32;
            target_buf[base + 2 * plane + cell] = bw / imgsz as f32;
            target_buf[base + 3 * plane + cell] = bh / imgsz as f32;
            target_buf[base + 4 * plane + cell] = 1.;
            target_buf[base + (BOX_CHANNELS + b.class) * plane + cell] = 1.;

            for ch in 0..channels {
                mask_buf[base + ch * plane + cell] = 1.;
            }
        }
    }

    let input = Tensor::from_data(TensorData::new(image_buf, [batch, 3, size, size]), device);
    let target = Tensor::from_data(
        TensorData::new(target_buf, [batch, channels, grid, grid]),
        device,
    );
    let mask = Tensor::from_data(
        TensorData::new(mask_buf, [batch, channels, grid, grid]),
        device,
    );
    Ok((input, target, mask))
}

//! 検出ネットワークを定義するモジュール

use anyhow::{Context, Result};
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::activation::{leaky_relu, sigmoid};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// 推論用バックエンド
pub type InferBackend = burn_ndarray::NdArray<f32>;
/// 学習用バックエンド
pub type TrainBackend = burn::backend::Autodiff<InferBackend>;

/// バックボーン全体のダウンサンプル倍率
pub const STRIDE: u32 = 32;
/// 1セルあたりのボックスチャネル数 (cx, cy, w, h, objectness)
pub const BOX_CHANNELS: usize = 5;

/// 入力の一辺の長さに対応する出力グリッドの一辺の長さを返します。
pub fn grid_size(imgsz: u32) -> usize {
    (imgsz / STRIDE) as usize
}

/// 検出ネットワークの設定
#[derive(Debug, Clone)]
pub struct FishNetConfig {
    /// クラス数
    pub num_classes: usize,
}

impl FishNetConfig {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }
}

/// 魚種検出ネットワーク
///
/// 3x3畳み込みとマックスプーリングを5段重ねたバックボーン (ダウンサンプル倍率32) に、
/// 1x1畳み込みの検出ヘッドを載せた単一スケールの構成です。
/// 出力は `[batch, 5 + クラス数, S, S]` で、全チャネルにsigmoidを適用します。
#[derive(Debug, Module)]
pub struct FishNet<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    conv4: Conv2d<B>,
    conv5: Conv2d<B>,
    head: Conv2d<B>,
    pool: MaxPool2d,
}

impl<B: Backend> FishNet<B> {
    /// 新しいFishNetを作成します。
    ///
    /// # Args
    /// * `cfg` - ネットワークの設定
    /// * `device` - パラメータを配置するデバイス
    ///
    /// # Return
    /// * 新たなFishNetインスタンス (重みはランダム初期化)
    pub fn new(cfg: FishNetConfig, device: &B::Device) -> Self {
        let conv = |input_ch: usize, output_ch: usize| {
            Conv2dConfig::new([input_ch, output_ch], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        Self {
            conv1: conv(3, 16),
            conv2: conv(16, 32),
            conv3: conv(32, 64),
            conv4: conv(64, 128),
            conv5: conv(128, 256),
            head: Conv2dConfig::new([256, BOX_CHANNELS + cfg.num_classes], [1, 1]).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    /// 順伝播を実行します。
    ///
    /// # Args
    /// * `input` - 入力画像 (`[batch, 3, imgsz, imgsz]`, `0.0..=1.0`)
    ///
    /// # Return
    /// * 検出ヘッドの出力 (`[batch, 5 + クラス数, S, S]`)
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.pool.forward(leaky_relu(self.conv1.forward(input), 0.1));
        let x = self.pool.forward(leaky_relu(self.conv2.forward(x), 0.1));
        let x = self.pool.forward(leaky_relu(self.conv3.forward(x), 0.1));
        let x = self.pool.forward(leaky_relu(self.conv4.forward(x), 0.1));
        let x = self.pool.forward(leaky_relu(self.conv5.forward(x), 0.1));
        sigmoid(self.head.forward(x))
    }
}

/// 名前付きのパラメータテンソル1つ分
#[derive(Debug, Clone)]
pub struct NamedTensor {
    /// パラメータ名 (`conv1.weight` など)
    pub name: String,
    /// テンソルの形状
    pub shape: Vec<usize>,
    /// テンソルの中身 (行優先)
    pub data: Vec<f32>,
}

impl<B: Backend> FishNet<B> {
    /// すべてのパラメータを名前付きテンソルとして取り出します。
    pub fn named_tensors(&self) -> Result<Vec<NamedTensor>> {
        fn entry<B: Backend, const D: usize>(
            name: &str,
            tensor: Tensor<B, D>,
        ) -> Result<NamedTensor> {
            let shape = tensor.dims().to_vec();
            let data = tensor
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| anyhow::anyhow!("failed to read tensor {}: {:?}", name, e))?;
            Ok(NamedTensor {
                name: name.to_string(),
                shape,
                data,
            })
        }

        let convs = [
            ("conv1", &self.conv1),
            ("conv2", &self.conv2),
            ("conv3", &self.conv3),
            ("conv4", &self.conv4),
            ("conv5", &self.conv5),
            ("head", &self.head),
        ];

        let mut tensors = Vec::new();
        for (name, conv) in convs {
            tensors.push(entry(&format!("{name}.weight"), conv.weight.val())?);
            if let Some(bias) = &conv.bias {
                tensors.push(entry(&format!("{name}.bias"), bias.val())?);
            }
        }
        Ok(tensors)
    }
}

/// モデルの重みをバイト列に変換します。
pub fn record_to_bytes<B: Backend>(model: &FishNet<B>) -> Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::new();
    recorder
        .record(model.clone().into_record(), ())
        .context("failed to serialize model record")
}

/// バイト列から重みを読み込んだモデルを作成します。
///
/// # Args
/// * `cfg` - ネットワークの設定 (バイト列の生成時と一致している必要があります)
/// * `bytes` - `record_to_bytes`が生成したバイト列
/// * `device` - パラメータを配置するデバイス
pub fn model_from_bytes<B: Backend>(
    cfg: FishNetConfig,
    bytes: Vec<u8>,
    device: &B::Device,
) -> Result<FishNet<B>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::new();
    let record: FishNetRecord<B> = recorder
        .load(bytes, device)
        .context("failed to load model record")?;
    Ok(FishNet::new(cfg, device).load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_produces_grid_shaped_output() {
        let device = Default::default();
        let model: FishNet<InferBackend> = FishNet::new(FishNetConfig::new(7), &device);
        let input = Tensor::<InferBackend, 4>::zeros([1, 3, 64, 64], &device);
        let out = model.forward(input);
        assert_eq!(out.dims(), [1, BOX_CHANNELS + 7, 2, 2]);
    }

    #[test]
    fn record_roundtrip_preserves_output() {
        let device = Default::default();
        let model: FishNet<InferBackend> = FishNet::new(FishNetConfig::new(2), &device);
        let input = Tensor::<InferBackend, 4>::ones([1, 3, 32, 32], &device);
        let before: Vec<f32> = model
            .forward(input.clone())
            .into_data()
            .to_vec()
            .expect("contiguous f32 output");

        let bytes = record_to_bytes(&model).unwrap();
        let restored: FishNet<InferBackend> =
            model_from_bytes(FishNetConfig::new(2), bytes, &device).unwrap();
        let after: Vec<f32> = restored
            .forward(input)
            .into_data()
            .to_vec()
            .expect("contiguous f32 output");
        assert_eq!(before, after);
    }
}

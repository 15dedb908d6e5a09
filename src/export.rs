//! 学習済みの重みを持ち運び用の形式で書き出すモジュール

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use safetensors::tensor::TensorView;
use safetensors::Dtype;

use crate::model::FishNet;

/// モデルのすべてのパラメータをsafetensorsファイルとして書き出します。
///
/// # Args
/// * `model` - 書き出すモデル
/// * `path` - 出力先のパス
pub fn export_safetensors<B: Backend>(model: &FishNet<B>, path: &Path) -> Result<()> {
    let tensors = model.named_tensors()?;

    // TensorViewは借用なので、まず全テンソルのリトルエンディアン表現を確保する
    let buffers: Vec<Vec<u8>> = tensors
        .iter()
        .map(|t| t.data.iter().flat_map(|v| v.to_le_bytes()).collect())
        .collect();

    let mut views = Vec::with_capacity(tensors.len());
    for (t, bytes) in tensors.iter().zip(&buffers) {
        let view = TensorView::new(Dtype::F32, t.shape.clone(), bytes)
            .with_context(|| format!("failed to build tensor view for {}", t.name))?;
        views.push((t.name.clone(), view));
    }

    let serialized =
        safetensors::serialize(views, &None).context("failed to serialize safetensors")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serialized)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FishNetConfig, InferBackend};
    use safetensors::SafeTensors;

    #[test]
    fn exported_file_contains_all_parameters() {
        let device = Default::default();
        let model: FishNet<InferBackend> = FishNet::new(FishNetConfig::new(3), &device);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        export_safetensors(&model, &path).unwrap();

        let bytes = fs::read(&path).unwrap();
        let loaded = SafeTensors::deserialize(&bytes).unwrap();

        // 畳み込み5層 + ヘッドで、それぞれweightとbias
        assert_eq!(loaded.names().len(), 12);
        let head = loaded.tensor("head.weight").unwrap();
        assert_eq!(head.shape(), &[5 + 3, 256, 1, 1]);
    }
}

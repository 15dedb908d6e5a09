//! YOLOv8系の魚種検出モデルをコントロールするモジュール

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder, Header};

use crate::dataset::DatasetDescriptor;
use crate::engine::{
    ExportFormat, PredictConfig, Prediction, TrainConfig, TrainReport, Yolo,
};
use crate::export::export_safetensors;
use crate::img_proc;
use crate::model::{
    model_from_bytes, record_to_bytes, FishNet, FishNetConfig, InferBackend,
};
use crate::postprocess;
use crate::trainer;

/// NMSのIoU閾値
const NMS_THRESHOLD: f32 = 0.45;
/// 推論結果の描画画像の出力先
const PREDICT_DIR: &str = "runs/detect/predict";

/// チェックポイントに同梱するメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMeta {
    /// クラス名
    pub names: Vec<String>,
    /// モデル入力の一辺の長さ
    pub imgsz: u32,
}

/// 魚種検出モデルをコントロールする構造体
pub struct YoloV8Fish {
    model: FishNet<InferBackend>,
    meta: ModelMeta,
    nms_threshold: f32,
    run_dir: Option<PathBuf>,
    device: <InferBackend as Backend>::Device,
}

impl YoloV8Fish {
    /// チェックポイントから新しい `YoloV8Fish` インスタンスを作成します。
    ///
    /// # Args
    /// * `checkpoint` - チェックポイント (gzipアーカイブ) のパス
    ///
    /// # Return
    /// * 新たな `YoloV8Fish` インスタンス
    pub fn new<P: AsRef<Path>>(checkpoint: P) -> Result<Self> {
        let (record, meta) = read_checkpoint(checkpoint.as_ref())?;
        let device = <InferBackend as Backend>::Device::default();
        let model = model_from_bytes(FishNetConfig::new(meta.names.len()), record, &device)
            .with_context(|| {
                format!("corrupt checkpoint {}", checkpoint.as_ref().display())
            })?;

        Ok(Self {
            model,
            meta,
            nms_threshold: NMS_THRESHOLD,
            run_dir: None,
            device,
        })
    }

    /// ランダム初期化された重みでインスタンスを作成します。
    ///
    /// ベースのチェックポイントを新規に用意する場合に使用します。
    pub fn untrained(meta: ModelMeta) -> Self {
        let device = <InferBackend as Backend>::Device::default();
        let model = FishNet::new(FishNetConfig::new(meta.names.len()), &device);
        Self {
            model,
            meta,
            nms_threshold: NMS_THRESHOLD,
            run_dir: None,
            device,
        }
    }

    /// 現在の重みをチェックポイントとして保存します。
    ///
    /// # Args
    /// * `path` - 保存先のパス
    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let record = record_to_bytes(&self.model)?;
        write_checkpoint(path.as_ref(), &record, &self.meta)
    }

    /// チェックポイントのメタデータを返します。
    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }
}

impl Yolo for YoloV8Fish {
    /// データセット記述ファイルを読み込んで学習を実行し、
    /// `<project>/<name>/weights/` に `last.tar.gz` と `best.tar.gz` を保存します。
    /// 学習後、このインスタンスは最良エポックの重みに切り替わります。
    fn train(&mut self, cfg: &TrainConfig) -> Result<TrainReport> {
        let descriptor = DatasetDescriptor::load(&cfg.data)?;
        let data_root = cfg.data.parent().unwrap_or(Path::new("."));

        let base = if cfg.pretrained {
            if descriptor.num_classes() != self.meta.names.len() {
                bail!(
                    "base checkpoint has {} classes but dataset lists {}",
                    self.meta.names.len(),
                    descriptor.num_classes()
                );
            }
            Some(record_to_bytes(&self.model)?)
        } else {
            None
        };

        let trained = trainer::run_train(cfg, &descriptor, data_root, base)?;

        let run_dir = cfg.project.join(&cfg.name);
        let weights_dir = run_dir.join("weights");
        fs::create_dir_all(&weights_dir)
            .with_context(|| format!("failed to create {}", weights_dir.display()))?;

        let meta = ModelMeta {
            names: descriptor.names(),
            imgsz: cfg.imgsz,
        };
        write_checkpoint(&weights_dir.join("last.tar.gz"), &trained.last, &meta)?;
        let best_weights = weights_dir.join("best.tar.gz");
        write_checkpoint(&best_weights, &trained.best, &meta)?;
        info!("saved checkpoints to {}", weights_dir.display());

        // ハンドルを最良エポックの重みに差し替える
        self.model = model_from_bytes(
            FishNetConfig::new(meta.names.len()),
            trained.best,
            &self.device,
        )?;
        self.meta = meta;
        self.run_dir = Some(run_dir.clone());

        Ok(TrainReport {
            epochs_run: trained.epochs_run,
            final_loss: trained.final_loss,
            best_loss: trained.best_loss,
            run_dir,
            best_weights,
        })
    }

    /// 現在の重みを書き出します。学習直後は学習結果の `weights/` に、
    /// それ以外はカレントディレクトリに出力します。
    fn export(&mut self, format: ExportFormat) -> Result<PathBuf> {
        let path = match format {
            ExportFormat::SafeTensors => match &self.run_dir {
                Some(run_dir) => run_dir.join("weights").join("best.safetensors"),
                None => PathBuf::from("model.safetensors"),
            },
        };
        export_safetensors(&self.model, &path)?;
        info!("exported model to {}", path.display());
        Ok(path)
    }

    /// 1枚の画像に対して推論を実行します。`show` が有効な場合は検出結果を
    /// 描画した画像を `runs/detect/predict/` に保存します。
    fn predict(&mut self, cfg: &PredictConfig) -> Result<Prediction> {
        let img = image::open(&cfg.source)
            .map_err(|e| anyhow!("failed to open image {}: {e}", cfg.source.display()))?;

        let imgsz = self.meta.imgsz;
        let size = imgsz as usize;
        let input_data = img_proc::letterbox(&img, imgsz);
        let input = Tensor::<InferBackend, 4>::from_data(
            TensorData::new(input_data, [1, 3, size, size]),
            &self.device,
        );

        let raw: Vec<f32> = self
            .model
            .forward(input)
            .into_data()
            .to_vec()
            .map_err(|e| anyhow!("failed to read model output: {:?}", e))?;

        let detections: Vec<_> = postprocess::post_process(
            &raw,
            self.meta.names.len(),
            imgsz,
            cfg.conf,
            self.nms_threshold,
        )
        .iter()
        .map(|d| d.reverse_transform(img.width(), img.height(), imgsz))
        .collect();
        info!(
            "{}: {} detections above conf {}",
            cfg.source.display(),
            detections.len(),
            cfg.conf
        );

        let overlay = if cfg.show {
            let mut rgb_img = img.to_rgb8();
            img_proc::draw_bbox(&mut rgb_img, &detections, &self.meta.names, 20., 4);

            let out_dir = Path::new(PREDICT_DIR);
            fs::create_dir_all(out_dir)?;
            let stem = cfg
                .source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "out".to_string());
            let path = out_dir.join(format!("{stem}.png"));
            rgb_img.save(&path)?;
            info!("saved prediction overlay to {}", path.display());
            Some(path)
        } else {
            None
        };

        Ok(Prediction {
            detections,
            overlay,
        })
    }
}

/// チェックポイントのアーカイブを読み込みます。
///
/// # Args
/// * `path` - チェックポイント (gzipアーカイブ) のパス
///
/// # 注意
/// この関数はアーカイブ内のファイルを名前で振り分けます。
/// * `model.bin` はモデルの重みとして解釈されます。
/// * `meta.json` はメタデータとして解釈されます。
/// * それ以外のファイル名の場合、警告がログに出力され、そのファイルは無視されます。
fn read_checkpoint(path: &Path) -> Result<(Vec<u8>, ModelMeta)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open checkpoint {}", path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut record: Option<Vec<u8>> = None;
    let mut meta: Option<ModelMeta> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry
            .path()?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match name.as_str() {
            "model.bin" => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                record = Some(buf);
            }
            "meta.json" => {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf)?;
                meta = Some(serde_json::from_slice(&buf).with_context(|| {
                    format!("malformed meta.json in {}", path.display())
                })?);
            }
            _ => warn!("unknown archive entry: {}", name),
        }
    }

    let record =
        record.with_context(|| format!("model.bin not found in {}", path.display()))?;
    let meta = meta.with_context(|| format!("meta.json not found in {}", path.display()))?;
    Ok((record, meta))
}

/// チェックポイントのアーカイブを書き込みます。
fn write_checkpoint(path: &Path, record: &[u8], meta: &ModelMeta) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(path)
        .with_context(|| format!("failed to create checkpoint {}", path.display()))?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));

    let mut header = Header::new_gnu();
    header.set_size(record.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, "model.bin", record)?;

    let meta_json = serde_json::to_vec_pretty(meta)?;
    let mut header = Header::new_gnu();
    header.set_size(meta_json.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, "meta.json", meta_json.as_slice())?;

    builder.into_inner()?.finish()?;
    Ok(())
}

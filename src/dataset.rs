//! 学習データセットを扱うモジュール
//!
//! データセット記述ファイル (`data.yaml`) はクラス名の一覧と、学習・検証用の
//! 画像ディレクトリの場所を列挙します。ラベルは画像1枚につき1つのテキストファイルで、
//! 1行が `class cx cy w h` (すべて画像サイズに対する比率) の形式です。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::warn;
use serde::Deserialize;

/// データセット記述ファイルの内容
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetDescriptor {
    /// データセットのルートディレクトリ (省略時は記述ファイルのあるディレクトリ)
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// 学習用画像ディレクトリ
    pub train: PathBuf,
    /// 検証用画像ディレクトリ
    #[serde(default)]
    pub val: Option<PathBuf>,
    /// クラス数 (省略可。`names` と矛盾する場合はエラー)
    #[serde(default)]
    pub nc: Option<usize>,
    /// クラス名
    names: Names,
}

/// クラス名の表現。リスト形式とインデックス付きマップ形式の両方を受け付ける
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Names {
    List(Vec<String>),
    Map(BTreeMap<usize, String>),
}

impl DatasetDescriptor {
    /// データセット記述ファイルを読み込みます。
    ///
    /// # Args
    /// * `path` - 記述ファイル (`data.yaml`) のパス
    ///
    /// # Return
    /// * 検証済みのDatasetDescriptor
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read dataset descriptor {}", path.display()))?;
        let descriptor: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("malformed dataset descriptor {}", path.display()))?;

        let names = descriptor.names();
        if names.is_empty() {
            bail!("dataset descriptor has no class names");
        }
        if let Some(nc) = descriptor.nc {
            if nc != names.len() {
                bail!("nc = {} but {} class names are listed", nc, names.len());
            }
        }
        Ok(descriptor)
    }

    /// クラス名をID順のベクトルとして返します。
    pub fn names(&self) -> Vec<String> {
        match &self.names {
            Names::List(list) => list.clone(),
            Names::Map(map) => map.values().cloned().collect(),
        }
    }

    /// クラス数を返します。
    pub fn num_classes(&self) -> usize {
        match &self.names {
            Names::List(list) => list.len(),
            Names::Map(map) => map.len(),
        }
    }

    /// 学習用のサンプル一覧を読み込みます。
    ///
    /// # Args
    /// * `base` - 記述ファイルのあるディレクトリ
    ///
    /// # Return
    /// * パス順にソートされたサンプルのベクトル
    pub fn train_samples(&self, base: &Path) -> Result<Vec<Sample>> {
        collect_samples(&self.resolve(base, &self.train), self.num_classes())
    }

    /// 検証用のサンプル一覧を読み込みます。`val` が未指定の場合はNoneを返します。
    pub fn val_samples(&self, base: &Path) -> Result<Option<Vec<Sample>>> {
        match &self.val {
            Some(val) => Ok(Some(collect_samples(
                &self.resolve(base, val),
                self.num_classes(),
            )?)),
            None => Ok(None),
        }
    }

    /// 記述ファイル内の相対パスをデータセットのルートからのパスに解決します。
    fn resolve(&self, base: &Path, split: &Path) -> PathBuf {
        if split.is_absolute() {
            return split.to_path_buf();
        }
        let root = match &self.path {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => base.join(p),
            None => base.to_path_buf(),
        };
        root.join(split)
    }
}

/// ラベルファイルの1行分のバウンディングボックス
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelBox {
    /// クラスID
    pub class: usize,
    /// バウンディングボックス中心のx (画像幅に対する比率)
    pub cx: f32,
    /// バウンディングボックス中心のy (画像高さに対する比率)
    pub cy: f32,
    /// バウンディングボックスの幅 (画像幅に対する比率)
    pub w: f32,
    /// バウンディングボックスの高さ (画像高さに対する比率)
    pub h: f32,
}

/// 画像1枚とそのラベルの組
#[derive(Debug, Clone)]
pub struct Sample {
    /// 画像ファイルのパス
    pub image: PathBuf,
    /// ラベル (背景のみの画像では空)
    pub boxes: Vec<LabelBox>,
}

/// 画像パスに対応するラベルファイルのパスを返します。
///
/// `images` ディレクトリを `labels` に置き換え、拡張子を `.txt` にします。
/// `images` が含まれない場合は同じディレクトリの `.txt` を指します。
pub fn label_path_for(image: &Path) -> PathBuf {
    let mut components: Vec<String> = image
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    for part in components.iter_mut().rev().skip(1) {
        if part == "images" {
            *part = "labels".to_string();
            break;
        }
    }
    let mut path: PathBuf = components.iter().collect();
    if image.is_absolute() && !path.is_absolute() {
        path = PathBuf::from("/").join(path);
    }
    path.set_extension("txt");
    path
}

/// ラベルファイルを解析します。
///
/// # Args
/// * `path` - ラベルファイルのパス
/// * `num_classes` - クラス数 (範囲外のクラスIDはエラー)
///
/// # Return
/// * バウンディングボックスのベクトル
pub fn parse_label_file(path: &Path, num_classes: usize) -> Result<Vec<LabelBox>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read label file {}", path.display()))?;

    let mut boxes = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 {
            bail!(
                "{}:{}: expected 5 fields, got {}",
                path.display(),
                lineno + 1,
                fields.len()
            );
        }
        let class: usize = fields[0]
            .parse()
            .with_context(|| format!("{}:{}: bad class id", path.display(), lineno + 1))?;
        if class >= num_classes {
            bail!(
                "{}:{}: class id {} out of range (nc = {})",
                path.display(),
                lineno + 1,
                class,
                num_classes
            );
        }
        let mut coords = [0f32; 4];
        for (i, field) in fields[1..].iter().enumerate() {
            let v: f32 = field
                .parse()
                .with_context(|| format!("{}:{}: bad coordinate", path.display(), lineno + 1))?;
            if !(0. ..=1.).contains(&v) {
                bail!(
                    "{}:{}: coordinate {} outside 0..=1",
                    path.display(),
                    lineno + 1,
                    v
                );
            }
            coords[i] = v;
        }
        boxes.push(LabelBox {
            class,
            cx: coords[0],
            cy: coords[1],
            w: coords[2],
            h: coords[3],
        });
    }
    Ok(boxes)
}

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// 画像ディレクトリを走査し、ラベルと対にしたサンプル一覧を作成します。
fn collect_samples(images_dir: &Path, num_classes: usize) -> Result<Vec<Sample>> {
    let entries = fs::read_dir(images_dir)
        .with_context(|| format!("failed to read image directory {}", images_dir.display()))?;

    let mut samples = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !is_image {
            continue;
        }

        let label_path = label_path_for(&path);
        let boxes = if label_path.is_file() {
            parse_label_file(&label_path, num_classes)?
        } else {
            // ラベルなしは背景のみの画像として扱う
            warn!("no label file for {}", path.display());
            Vec::new()
        };
        samples.push(Sample { image: path, boxes });
    }

    // 走査順はOS依存なのでパス順に揃える
    samples.sort_by(|a, b| a.image.cmp(&b.image));
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn label_path_swaps_images_directory() {
        let label = label_path_for(Path::new("datasets/fish/images/train/a_001.jpg"));
        assert_eq!(label, Path::new("datasets/fish/labels/train/a_001.txt"));
    }

    #[test]
    fn label_path_without_images_directory_stays_alongside() {
        let label = label_path_for(Path::new("frames/a_001.jpg"));
        assert_eq!(label, Path::new("frames/a_001.txt"));
    }

    #[test]
    fn parse_label_file_reads_boxes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "0 0.5 0.5 0.25 0.25\n1 0.1 0.2 0.05 0.05\n").unwrap();

        let boxes = parse_label_file(&path, 2).unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].class, 0);
        assert!((boxes[1].cy - 0.2).abs() < 1e-6);
    }

    #[test]
    fn parse_label_file_rejects_out_of_range_class() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, "7 0.5 0.5 0.25 0.25\n").unwrap();
        assert!(parse_label_file(&path, 7).is_err());
    }

    #[test]
    fn descriptor_accepts_name_list_and_map() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.yaml");
        fs::write(&list, "train: images\nnames: [bangus, tilapia]\n").unwrap();
        let d = DatasetDescriptor::load(&list).unwrap();
        assert_eq!(d.names(), vec!["bangus", "tilapia"]);

        let map = dir.path().join("map.yaml");
        fs::write(&map, "train: images\nnames:\n  0: bangus\n  1: tilapia\n").unwrap();
        let d = DatasetDescriptor::load(&map).unwrap();
        assert_eq!(d.num_classes(), 2);
    }

    #[test]
    fn val_samples_follow_the_val_split() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("images/train")).unwrap();
        fs::create_dir_all(dir.path().join("images/val")).unwrap();
        fs::write(dir.path().join("images/val/v.png"), b"").unwrap();
        // 拡張子だけ見て収集するので中身は不要 (ラベルなしは背景扱い)
        let yaml = dir.path().join("data.yaml");
        fs::write(
            &yaml,
            "train: images/train\nval: images/val\nnames: [bangus]\n",
        )
        .unwrap();

        let d = DatasetDescriptor::load(&yaml).unwrap();
        assert!(d.train_samples(dir.path()).unwrap().is_empty());
        let val = d.val_samples(dir.path()).unwrap().unwrap();
        assert_eq!(val.len(), 1);
        assert!(val[0].boxes.is_empty());
    }

    #[test]
    fn descriptor_rejects_nc_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "train: images\nnc: 3\nnames: [bangus]\n").unwrap();
        assert!(DatasetDescriptor::load(&path).is_err());
    }
}

//! Manifest-driven chest radiograph dataset.
//!
//! A manifest is a CSV file whose first row is a header, whose first column
//! is an image path relative to the dataset root, and whose label cells start
//! at a fixed column offset, one cell per diagnostic class. Labels are
//! resolved eagerly at load time through the [`LabelPolicy`]; image pixels
//! are decoded lazily, one sample at a time.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::RgbImage;
use image::imageops::{self, FilterType};
use tracing::debug;

use crate::error::{Result, ThoraxError};
use crate::labels::LabelPolicy;

/// First manifest column that holds a label cell. Columns 1..5 carry
/// demographic and view metadata that the classifier does not consume.
pub const LABEL_COLUMN_OFFSET: usize = 5;

/// ImageNet channel means, used by the default normalization.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One manifest row: an image path plus its resolved binary target vector.
#[derive(Debug, Clone)]
pub struct ManifestRecord {
    /// Image path relative to the dataset root.
    pub image_path: PathBuf,
    /// Resolved labels, one `0.0`/`1.0` entry per class.
    pub labels: Vec<f32>,
}

/// Resize / center-crop / normalize pipeline applied to every decoded image.
#[derive(Debug, Clone)]
pub struct TransformPipeline {
    /// Target length of the shorter image side before cropping.
    pub resize: u32,
    /// Side length of the square center crop.
    pub crop: u32,
    /// Per-channel mean subtracted after scaling to `[0, 1]`.
    pub mean: [f32; 3],
    /// Per-channel standard deviation divisor.
    pub std: [f32; 3],
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self {
            resize: 256,
            crop: 224,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

impl TransformPipeline {
    /// Apply the pipeline to a decoded RGB image, producing a `[3, crop,
    /// crop]` float tensor on the CPU.
    pub fn apply(&self, img: &RgbImage) -> Result<Tensor> {
        let (w, h) = img.dimensions();
        let shorter = w.min(h).max(1);
        let scale = f64::from(self.resize) / f64::from(shorter);
        let nw = ((f64::from(w) * scale).round() as u32).max(self.crop);
        let nh = ((f64::from(h) * scale).round() as u32).max(self.crop);
        let resized = imageops::resize(img, nw, nh, FilterType::Triangle);

        let x0 = (nw - self.crop) / 2;
        let y0 = (nh - self.crop) / 2;
        let cropped = imageops::crop_imm(&resized, x0, y0, self.crop, self.crop).to_image();

        let side = self.crop as usize;
        let plane = side * side;
        let mut data = vec![0f32; 3 * plane];
        for (x, y, pixel) in cropped.enumerate_pixels() {
            let offset = y as usize * side + x as usize;
            for c in 0..3 {
                data[c * plane + offset] =
                    (f32::from(pixel[c]) / 255.0 - self.mean[c]) / self.std[c];
            }
        }
        Ok(Tensor::from_vec(data, (3, side, side), &Device::Cpu)?)
    }
}

/// Indexable collection of (image tensor, resolved label vector) samples.
pub struct ChestXrayDataset {
    records: Vec<ManifestRecord>,
    root: PathBuf,
    transform: TransformPipeline,
    class_count: usize,
}

impl ChestXrayDataset {
    /// Load a manifest and resolve every label row against `policy`.
    ///
    /// A row that is too short to cover the declared classes aborts the load;
    /// there is no partial-failure recovery.
    pub fn from_manifest(
        manifest: &Path,
        root: &Path,
        policy: &LabelPolicy,
        transform: TransformPipeline,
    ) -> Result<Self> {
        let class_count = policy.class_count();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(manifest)?;

        let mut records = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let image_path = record
                .get(0)
                .filter(|cell| !cell.is_empty())
                .ok_or_else(|| ThoraxError::Manifest {
                    row,
                    reason: "missing image path in column 0".into(),
                })?;
            if record.len() < LABEL_COLUMN_OFFSET + class_count {
                return Err(ThoraxError::Manifest {
                    row,
                    reason: format!(
                        "expected at least {} columns, found {}",
                        LABEL_COLUMN_OFFSET + class_count,
                        record.len()
                    ),
                });
            }

            let cells: Vec<&str> = (LABEL_COLUMN_OFFSET..LABEL_COLUMN_OFFSET + class_count)
                .map(|i| record.get(i).unwrap_or(""))
                .collect();
            let labels = policy.resolve_row(&cells)?;

            records.push(ManifestRecord {
                image_path: PathBuf::from(image_path),
                labels,
            });
        }

        debug!(rows = records.len(), manifest = %manifest.display(), "manifest loaded");
        Ok(Self {
            records,
            root: root.to_path_buf(),
            transform,
            class_count,
        })
    }

    /// Number of manifest rows.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of diagnostic classes per label vector.
    pub fn class_count(&self) -> usize {
        self.class_count
    }

    /// Resolved label vector for the sample at `index`, without touching the
    /// image file.
    pub fn labels(&self, index: usize) -> Option<&[f32]> {
        self.records.get(index).map(|r| r.labels.as_slice())
    }

    /// Decode, transform, and return the sample at `index`.
    ///
    /// A missing or undecodable image is fatal and propagates.
    pub fn get(&self, index: usize) -> Result<(Tensor, Vec<f32>)> {
        let record = self.records.get(index).ok_or_else(|| ThoraxError::Manifest {
            row: index,
            reason: "sample index out of range".into(),
        })?;
        let path = self.root.join(&record.image_path);
        let img = image::open(&path)
            .map_err(|err| ThoraxError::Image {
                path: path.clone(),
                reason: err.to_string(),
            })?
            .to_rgb8();
        let tensor = self.transform.apply(&img)?;
        Ok((tensor, record.labels.clone()))
    }
}

/// Groups dataset samples into `[N, 3, H, W]` image batches and `[N, C]`
/// target batches on the configured device.
///
/// Batch consumption order within an epoch is sequential and deterministic;
/// the training split reshuffles between epochs with a seeded PRNG.
pub struct BatchLoader<'a> {
    dataset: &'a ChestXrayDataset,
    batch_size: usize,
    device: Device,
    order: Vec<usize>,
}

impl<'a> BatchLoader<'a> {
    pub fn new(dataset: &'a ChestXrayDataset, batch_size: usize, device: Device) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            device,
            order: (0..dataset.len()).collect(),
        }
    }

    /// Number of batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Number of samples per epoch.
    pub fn num_samples(&self) -> usize {
        self.order.len()
    }

    /// Reshuffle the sample order with a Fisher-Yates pass seeded from
    /// `(seed, epoch)`, so every run over the same data is reproducible.
    pub fn shuffle(&mut self, seed: u64, epoch: usize) {
        let mut rng = oorandom::Rand64::new(u128::from(seed) << 64 | epoch as u128);
        for i in (1..self.order.len()).rev() {
            let j = rng.rand_range(0..(i as u64 + 1)) as usize;
            self.order.swap(i, j);
        }
    }

    /// Ground-truth label rows in the loader's current iteration order.
    pub fn label_rows(&self) -> Vec<Vec<f32>> {
        self.order
            .iter()
            .filter_map(|&i| self.dataset.labels(i).map(<[f32]>::to_vec))
            .collect()
    }

    /// Iterate over `(images, targets)` batches. Any image failure aborts the
    /// epoch at that batch.
    pub fn iter(&self) -> BatchIter<'_> {
        BatchIter {
            loader: self,
            cursor: 0,
        }
    }
}

/// Iterator over the batches of a [`BatchLoader`].
pub struct BatchIter<'a> {
    loader: &'a BatchLoader<'a>,
    cursor: usize,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        let loader = self.loader;
        if self.cursor >= loader.order.len() {
            return None;
        }
        let end = (self.cursor + loader.batch_size).min(loader.order.len());
        let indices = &loader.order[self.cursor..end];
        self.cursor = end;
        Some(build_batch(loader, indices))
    }
}

fn build_batch(loader: &BatchLoader<'_>, indices: &[usize]) -> Result<(Tensor, Tensor)> {
    let class_count = loader.dataset.class_count();
    let mut images = Vec::with_capacity(indices.len());
    let mut targets = Vec::with_capacity(indices.len() * class_count);
    for &index in indices {
        let (image, labels) = loader.dataset.get(index)?;
        images.push(image);
        targets.extend_from_slice(&labels);
    }
    let images = Tensor::stack(&images, 0)?.to_device(&loader.device)?;
    let targets = Tensor::from_vec(targets, (indices.len(), class_count), &loader.device)?;
    Ok((images, targets))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::labels::LabelPolicy;

    fn tiny_transform() -> TransformPipeline {
        TransformPipeline {
            resize: 8,
            crop: 8,
            mean: [0.0; 3],
            std: [1.0; 3],
        }
    }

    fn write_manifest(dir: &Path, rows: &[&str]) -> PathBuf {
        let header =
            "Path,Sex,Age,Frontal/Lateral,AP/PA,c0,c1,c2,c3,c4,c5,c6,c7,c8,c9,c10,c11,c12,c13";
        let manifest = dir.join("train.csv");
        let mut contents = String::from(header);
        for row in rows {
            contents.push('\n');
            contents.push_str(row);
        }
        fs::write(&manifest, contents).unwrap();
        manifest
    }

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) {
        let img = RgbImage::from_fn(w, h, |x, y| image::Rgb([x as u8, y as u8, 128]));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn manifest_rows_become_samples() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png", 12, 9);
        let manifest = write_manifest(
            dir.path(),
            &["a.png,F,60,Frontal,AP,1,,0,,,,,,-1,,-1,,1,-1"],
        );

        let policy = LabelPolicy::chexpert_default();
        let dataset =
            ChestXrayDataset::from_manifest(&manifest, dir.path(), &policy, tiny_transform())
                .unwrap();
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.class_count(), 14);

        let (image, labels) = dataset.get(0).unwrap();
        assert_eq!(image.dims(), &[3, 8, 8]);
        assert_eq!(labels.len(), 14);
        // Column layout: class 0 is "1", class 8 is "-1" (AssignZero),
        // class 10 is "-1" (AssignOne), class 12 is "1", class 13 is "-1"
        // (AssignOne).
        assert_eq!(labels[0], 1.0);
        assert_eq!(labels[8], 0.0);
        assert_eq!(labels[10], 1.0);
        assert_eq!(labels[12], 1.0);
        assert_eq!(labels[13], 1.0);
    }

    #[test]
    fn short_row_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(dir.path(), &["a.png,F,60,Frontal,AP,1,0"]);
        let policy = LabelPolicy::chexpert_default();
        let err =
            ChestXrayDataset::from_manifest(&manifest, dir.path(), &policy, tiny_transform());
        assert!(matches!(err, Err(ThoraxError::Manifest { row: 0, .. })));
    }

    #[test]
    fn missing_image_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_manifest(
            dir.path(),
            &["nope.png,F,60,Frontal,AP,,,,,,,,,,,,,,"],
        );
        let policy = LabelPolicy::chexpert_default();
        let dataset =
            ChestXrayDataset::from_manifest(&manifest, dir.path(), &policy, tiny_transform())
                .unwrap();
        assert!(matches!(dataset.get(0), Err(ThoraxError::Image { .. })));
    }

    #[test]
    fn loader_batches_and_shuffle_are_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "b.png", "c.png"] {
            write_png(dir.path(), name, 8, 8);
        }
        let manifest = write_manifest(
            dir.path(),
            &[
                "a.png,F,60,Frontal,AP,1,,,,,,,,,,,,,",
                "b.png,M,41,Frontal,PA,,1,,,,,,,,,,,,",
                "c.png,F,73,Frontal,AP,,,1,,,,,,,,,,,",
            ],
        );
        let policy = LabelPolicy::chexpert_default();
        let dataset =
            ChestXrayDataset::from_manifest(&manifest, dir.path(), &policy, tiny_transform())
                .unwrap();

        let loader = BatchLoader::new(&dataset, 2, Device::Cpu);
        assert_eq!(loader.num_batches(), 2);
        let batches: Vec<_> = loader.iter().collect::<Result<_>>().unwrap();
        assert_eq!(batches[0].0.dims(), &[2, 3, 8, 8]);
        assert_eq!(batches[0].1.dims(), &[2, 14]);
        assert_eq!(batches[1].0.dims(), &[1, 3, 8, 8]);

        let mut first = BatchLoader::new(&dataset, 2, Device::Cpu);
        let mut second = BatchLoader::new(&dataset, 2, Device::Cpu);
        first.shuffle(7, 0);
        second.shuffle(7, 0);
        assert_eq!(first.label_rows(), second.label_rows());
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use log::{info, warn};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::augment::{push_pixels, AugmentationConfig, Augmenter};
use crate::labels::ClassIndex;
use crate::{Error, Result};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    Training,
    Validation,
}

/// One labelled image on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub path: PathBuf,
    /// Position of the class in the [`ClassIndex`]
    pub position: usize,
}

/// Class folders split into training and validation samples.
#[derive(Debug)]
pub struct ImageFolder {
    training: Vec<Sample>,
    validation: Vec<Sample>,
    num_classes: usize,
}

impl ImageFolder {
    /// Scan `root` and split every class.
    ///
    /// Files are sorted by name and the first `floor(n * validation_split)` of
    /// each class go to the validation subset, so repeated scans of the same
    /// directory always produce the same split.
    pub fn scan(root: &Path, index: &ClassIndex, validation_split: f64) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::Dataset(format!(
                "Dataset directory not found: {}",
                root.display()
            )));
        }

        let mut training = Vec::new();
        let mut validation = Vec::new();

        for (position, id) in index.ids().iter().enumerate() {
            let class_dir = root.join(id.to_string());
            if !class_dir.is_dir() {
                warn!("No image folder for class {} ({})", id, class_dir.display());
                continue;
            }

            let files = list_images(&class_dir)?;
            let split_at = (files.len() as f64 * validation_split) as usize;

            for (i, path) in files.into_iter().enumerate() {
                let sample = Sample { path, position };
                if i < split_at {
                    validation.push(sample);
                } else {
                    training.push(sample);
                }
            }
        }

        if training.is_empty() && validation.is_empty() {
            return Err(Error::Dataset(format!(
                "No images found under {}",
                root.display()
            )));
        }

        info!(
            "Found {} training and {} validation images belonging to {} classes",
            training.len(),
            validation.len(),
            index.len()
        );

        Ok(ImageFolder {
            training,
            validation,
            num_classes: index.len(),
        })
    }

    pub fn samples(&self, subset: Subset) -> &[Sample] {
        match subset {
            Subset::Training => &self.training,
            Subset::Validation => &self.validation,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }

        let is_image = path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false);

        if is_image {
            files.push(path);
        }
    }

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// A batch of images in NHWC layout plus their class positions.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Vec<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn one_hot(&self, num_classes: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; self.labels.len() * num_classes];
        for (row, label) in self.labels.iter().enumerate() {
            out[row * num_classes + label] = 1.0;
        }
        out
    }
}

/// Loads, resizes and (optionally) augments samples batch by batch.
pub struct DataFeed<'a> {
    samples: &'a [Sample],
    order: Vec<usize>,
    augmenter: Augmenter,
    image_size: u32,
    batch_size: usize,
    rng: ChaCha8Rng,
    shuffle: bool,
}

impl<'a> DataFeed<'a> {
    /// Shuffled, augmented feed.
    pub fn training(
        samples: &'a [Sample],
        config: AugmentationConfig,
        image_size: u32,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        let mut feed = DataFeed {
            samples,
            order: (0..samples.len()).collect(),
            augmenter: Augmenter::new(config),
            image_size,
            batch_size,
            rng: ChaCha8Rng::seed_from_u64(seed),
            shuffle: true,
        };
        feed.reshuffle();
        feed
    }

    /// Fixed order, no random transforms.
    pub fn validation(
        samples: &'a [Sample],
        config: AugmentationConfig,
        image_size: u32,
        batch_size: usize,
    ) -> Self {
        DataFeed {
            samples,
            order: (0..samples.len()).collect(),
            augmenter: Augmenter::new(config.without_transforms()),
            image_size,
            batch_size,
            rng: ChaCha8Rng::seed_from_u64(0),
            shuffle: false,
        }
    }

    /// Start a new pass. Only training feeds change their order.
    pub fn reshuffle(&mut self) {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        (self.samples.len() + self.batch_size - 1) / self.batch_size
    }

    /// Class positions in feed order.
    pub fn labels(&self) -> Vec<usize> {
        self.order.iter().map(|&i| self.samples[i].position).collect()
    }

    pub fn batch(&mut self, number: usize) -> Result<Batch> {
        let start = number * self.batch_size;
        let end = (start + self.batch_size).min(self.samples.len());
        let side = self.image_size as usize;

        let mut images = Vec::with_capacity((end.saturating_sub(start)) * side * side * 3);
        let mut labels = Vec::with_capacity(end.saturating_sub(start));

        for &i in self.order.get(start..end).unwrap_or(&[]) {
            let sample = &self.samples[i];

            let rgb = image::open(&sample.path)?.to_rgb8();
            let resized = image::imageops::resize(
                &rgb,
                self.image_size,
                self.image_size,
                FilterType::Triangle,
            );
            let augmented = self.augmenter.augment(&resized, &mut self.rng);

            push_pixels(&augmented, self.augmenter.config().rescale, &mut images);
            labels.push(sample.position);
        }

        Ok(Batch { images, labels })
    }
}

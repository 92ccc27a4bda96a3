use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::info;
use serde::Serialize;
use tensorflow::Tensor;

use crate::augment::AugmentationConfig;
use crate::charts::{self, Series, COLOR_TRAIN, COLOR_VALIDATION};
use crate::dataset::{DataFeed, ImageFolder, Subset};
use crate::evaluation::{log_report, ordered_names, predict_feed, write_reports, Predictions};
use crate::labels::{ClassIndex, ClassMapping};
use crate::metrics::{argmax, ClassificationReport};
use crate::model::{ArtifactManifest, Backbone, HeadSpec, ModelArtifact, TrainableHead};
use crate::{Error, Result, Timer, IMG_SIZE};

/// Hyperparameters of a training run.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub image_size: u32,
    pub batch_size: usize,
    pub epochs: usize,
    pub hidden_units: u64,
    pub dropout: f32,
    pub learning_rate: f32,
    /// Seed for shuffling and augmentation
    pub seed: u64,
    pub augmentation: AugmentationConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            image_size: IMG_SIZE,
            batch_size: 32,
            epochs: 400,
            hidden_units: 512,
            dropout: 0.5,
            learning_rate: 0.01,
            seed: 42,
            augmentation: AugmentationConfig::FOOD101,
        }
    }
}

/// Where training reads from and writes to.
#[derive(Debug, Clone)]
pub struct TrainingPaths {
    /// Root with one folder per class id
    pub dataset_dir: PathBuf,
    /// SavedModel of the pretrained feature extractor, copied into the artifact
    pub backbone_dir: PathBuf,
    /// Artifact directory to create
    pub model_dir: PathBuf,
    /// Charts, history and reports
    pub output_dir: PathBuf,
}

/// Per-epoch metrics, in the order the epochs ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct History {
    pub loss: Vec<f64>,
    pub accuracy: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub val_accuracy: Vec<f64>,
}

impl History {
    pub fn record(&mut self, train: EpochStats, validation: EpochStats) {
        self.loss.push(train.loss);
        self.accuracy.push(train.accuracy);
        self.val_loss.push(validation.loss);
        self.val_accuracy.push(validation.accuracy);
    }

    pub fn epochs(&self) -> usize {
        self.loss.len()
    }

    /// Write `accuracy.svg`, `loss.svg` and `history.json` to `output_dir`.
    pub fn save(&self, output_dir: &Path) -> Result<()> {
        fs::create_dir_all(output_dir)?;

        charts::line_chart(
            "Training and Validation Accuracy",
            "Epochs",
            "Accuracy",
            &[
                Series::new("Training Accuracy", self.accuracy.clone(), COLOR_TRAIN),
                Series::new("Validation Accuracy", self.val_accuracy.clone(), COLOR_VALIDATION),
            ],
            &output_dir.join("accuracy.svg"),
        )?;
        charts::line_chart(
            "Training and Validation Loss",
            "Epochs",
            "Loss",
            &[
                Series::new("Training Loss", self.loss.clone(), COLOR_TRAIN),
                Series::new("Validation Loss", self.val_loss.clone(), COLOR_VALIDATION),
            ],
            &output_dir.join("loss.svg"),
        )?;
        fs::write(
            output_dir.join("history.json"),
            serde_json::to_vec_pretty(self)?,
        )?;

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochStats {
    pub loss: f64,
    pub accuracy: f64,
}

impl From<&Predictions> for EpochStats {
    fn from(predictions: &Predictions) -> Self {
        EpochStats {
            loss: predictions.loss(),
            accuracy: predictions.accuracy(),
        }
    }
}

/// Running sums over the batches of one epoch.
#[derive(Debug, Default)]
struct Accumulator {
    loss: f64,
    correct: usize,
    seen: usize,
}

impl Accumulator {
    fn add(&mut self, loss: f32, probabilities: &[Vec<f32>], labels: &[usize]) {
        self.loss += loss as f64 * labels.len() as f64;
        self.correct += probabilities
            .iter()
            .zip(labels.iter())
            .filter(|(row, label)| argmax(row) == Some(**label))
            .count();
        self.seen += labels.len();
    }

    fn stats(&self) -> EpochStats {
        if self.seen == 0 {
            return EpochStats::default();
        }
        EpochStats {
            loss: self.loss / self.seen as f64,
            accuracy: self.correct as f64 / self.seen as f64,
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub history: History,
    pub report: ClassificationReport,
    pub artifact: ModelArtifact,
}

pub fn train(
    paths: &TrainingPaths,
    mapping: &ClassMapping,
    config: &TrainingConfig,
) -> Result<TrainingOutcome> {
    let index = ClassIndex::from_mapping(mapping);
    if index.is_empty() {
        return Err(Error::Dataset("label file lists no classes".into()));
    }
    let num_classes = index.len();

    let folder = ImageFolder::scan(
        &paths.dataset_dir,
        &index,
        config.augmentation.validation_split,
    )?;
    if folder.samples(Subset::Training).is_empty() {
        return Err(Error::Dataset("no training images".into()));
    }

    let backbone = Backbone::load(&paths.backbone_dir)?;
    let feature_shape = backbone.feature_shape(config.image_size)?;

    let head = TrainableHead::build(
        &HeadSpec {
            feature_shape,
            hidden_units: config.hidden_units,
            num_classes: num_classes as u64,
            learning_rate: config.learning_rate,
        },
        config.dropout,
    )?;

    let mut train_feed = DataFeed::training(
        folder.samples(Subset::Training),
        config.augmentation,
        config.image_size,
        config.batch_size,
        config.seed,
    );
    let mut val_feed = DataFeed::validation(
        folder.samples(Subset::Validation),
        config.augmentation,
        config.image_size,
        config.batch_size,
    );

    let predict = |images: &[f32], n: usize| -> Result<Vec<Vec<f32>>> {
        let features = backbone.features(images, n, config.image_size)?;
        head.predict(&features)
    };

    let mut history = History::default();

    for epoch in 1..=config.epochs {
        let mut t = Timer::new_start(&format!("Epoch {}/{}", epoch, config.epochs));

        let mut acc = Accumulator::default();
        for number in 0..train_feed.num_batches() {
            let batch = train_feed.batch(number)?;
            if batch.is_empty() {
                continue;
            }

            let features = backbone.features(&batch.images, batch.len(), config.image_size)?;
            let labels = Tensor::<f32>::new(&[batch.len() as u64, num_classes as u64])
                .with_values(&batch.one_hot(num_classes))?;

            let step = head.train_step(&features, &labels)?;
            acc.add(step.loss, &step.probabilities, &batch.labels);
        }
        train_feed.reshuffle();

        let train_stats = acc.stats();
        let val_stats = EpochStats::from(&predict_feed(&mut val_feed, &predict)?);

        t.stop();
        info!(
            "Epoch {}/{} - {}ms - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
            epoch,
            config.epochs,
            t.duration(),
            train_stats.loss,
            train_stats.accuracy,
            val_stats.loss,
            val_stats.accuracy
        );

        history.record(train_stats, val_stats);
    }

    let artifact = ModelArtifact::new(
        &paths.model_dir,
        ArtifactManifest {
            image_size: config.image_size,
            rescale: config.augmentation.rescale,
            feature_shape,
            num_classes,
            created: Utc::now(),
        },
    );
    head.save(&artifact.head_dir())?;
    artifact.install_backbone(&paths.backbone_dir)?;
    artifact.write_manifest()?;
    info!("Model saved to {}", artifact.dir().display());

    history.save(&paths.output_dir)?;

    // second full pass over the validation subset for the final report
    let predictions = predict_feed(&mut val_feed, &predict)?;
    let names = ordered_names(mapping, &index);
    let confusion = predictions.confusion(num_classes);
    let report = ClassificationReport::from_confusion(&confusion, &names);

    log_report(&report);
    write_reports(&paths.output_dir, &confusion, &report, &names)?;

    Ok(TrainingOutcome {
        history,
        report,
        artifact,
    })
}

use std::fs;
use std::path::Path;

use log::info;

use crate::augment::AugmentationConfig;
use crate::charts;
use crate::dataset::{DataFeed, ImageFolder, Subset};
use crate::labels::{ClassIndex, ClassMapping};
use crate::metrics::{argmax, cross_entropy, ClassificationReport, ConfusionMatrix};
use crate::model::ImageClassifier;
use crate::{Error, Result, Timer};

const EVAL_BATCH_SIZE: usize = 32;

/// Predicted distributions alongside the true class positions.
#[derive(Debug, Clone, Default)]
pub struct Predictions {
    pub probabilities: Vec<Vec<f32>>,
    pub truth: Vec<usize>,
}

impl Predictions {
    pub fn predicted(&self) -> Vec<usize> {
        self.probabilities
            .iter()
            .map(|row| argmax(row).unwrap_or(0))
            .collect()
    }

    pub fn loss(&self) -> f64 {
        cross_entropy(&self.probabilities, &self.truth)
    }

    pub fn accuracy(&self) -> f64 {
        if self.truth.is_empty() {
            return 0.0;
        }
        let correct = self
            .predicted()
            .iter()
            .zip(self.truth.iter())
            .filter(|(p, t)| p == t)
            .count();
        correct as f64 / self.truth.len() as f64
    }

    pub fn confusion(&self, num_classes: usize) -> ConfusionMatrix {
        ConfusionMatrix::from_predictions(&self.truth, &self.predicted(), num_classes)
    }
}

/// Run every batch of `feed` through `run` and collect the outputs.
pub fn predict_feed<F>(feed: &mut DataFeed<'_>, mut run: F) -> Result<Predictions>
where
    F: FnMut(&[f32], usize) -> Result<Vec<Vec<f32>>>,
{
    let mut predictions = Predictions::default();

    for number in 0..feed.num_batches() {
        let batch = feed.batch(number)?;
        if batch.is_empty() {
            continue;
        }

        let rows = run(&batch.images, batch.len())?;
        if rows.len() != batch.len() {
            return Err(Error::InvalidArtifact(format!(
                "model returned {} predictions for a batch of {}",
                rows.len(),
                batch.len()
            )));
        }

        predictions.probabilities.extend(rows);
        predictions.truth.extend(batch.labels);
    }

    Ok(predictions)
}

/// Class names in model output order.
pub fn ordered_names(mapping: &ClassMapping, index: &ClassIndex) -> Vec<String> {
    index
        .ids()
        .iter()
        .map(|id| mapping.name(*id).unwrap_or("Unknown").to_owned())
        .collect()
}

/// Write `confusion_matrix.svg` and `classification_report.txt`.
pub fn write_reports(
    output_dir: &Path,
    confusion: &ConfusionMatrix,
    report: &ClassificationReport,
    names: &[String],
) -> Result<()> {
    fs::create_dir_all(output_dir)?;

    charts::confusion_matrix_chart(confusion, names, &output_dir.join("confusion_matrix.svg"))?;
    fs::write(
        output_dir.join("classification_report.txt"),
        report.to_string(),
    )?;

    Ok(())
}

pub fn log_report(report: &ClassificationReport) {
    info!("Classification Report:\n{}", report);
    info!("Weighted Precision: {:.4}", report.weighted_avg.precision);
    info!("Weighted Recall: {:.4}", report.weighted_avg.recall);
    info!("Weighted F1-score: {:.4}", report.weighted_avg.f1);
}

/// Outcome of [`evaluate`].
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
    pub confusion: ConfusionMatrix,
    pub report: ClassificationReport,
}

/// Evaluate `classifier` on the validation subset of `dataset_dir`.
pub fn evaluate(
    classifier: &ImageClassifier,
    dataset_dir: &Path,
    mapping: &ClassMapping,
    output_dir: &Path,
) -> Result<Evaluation> {
    let index = ClassIndex::from_mapping(mapping);
    if index.len() != classifier.num_classes() {
        return Err(Error::InvalidArtifact(format!(
            "model predicts {} classes but the label file lists {}",
            classifier.num_classes(),
            index.len()
        )));
    }

    let config = AugmentationConfig::FOOD101;
    let folder = ImageFolder::scan(dataset_dir, &index, config.validation_split)?;
    let mut feed = DataFeed::validation(
        folder.samples(Subset::Validation),
        config,
        classifier.image_size(),
        EVAL_BATCH_SIZE,
    );

    let mut t = Timer::new_start("Evaluating");
    let predictions = predict_feed(&mut feed, |images, n| classifier.run(images, n))?;
    t.stop();

    let loss = predictions.loss();
    let accuracy = predictions.accuracy();
    info!("Validation Loss: {:.4}", loss);
    info!("Validation Accuracy: {:.2}%", accuracy * 100.0);

    let names = ordered_names(mapping, &index);
    let confusion = predictions.confusion(index.len());
    let report = ClassificationReport::from_confusion(&confusion, &names);

    log_report(&report);
    write_reports(output_dir, &confusion, &report, &names)?;

    Ok(Evaluation {
        loss,
        accuracy,
        confusion,
        report,
    })
}

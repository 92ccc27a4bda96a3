use std::fmt;

use serde::Serialize;

/// Rows are true classes, columns predicted classes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        ConfusionMatrix {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn from_predictions(truth: &[usize], predicted: &[usize], num_classes: usize) -> Self {
        let mut cm = ConfusionMatrix::new(num_classes);
        for (t, p) in truth.iter().zip(predicted.iter()) {
            cm.add(*t, *p);
        }
        cm
    }

    /// Out of range pairs are ignored.
    pub fn add(&mut self, truth: usize, predicted: usize) {
        if let Some(count) = self
            .counts
            .get_mut(truth)
            .and_then(|row| row.get_mut(predicted))
        {
            *count += 1;
        }
    }

    pub fn get(&self, truth: usize, predicted: usize) -> usize {
        self.counts[truth][predicted]
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn max(&self) -> usize {
        self.counts.iter().flatten().copied().max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassScores {
    pub name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Averages {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Precision, recall and F1 per class, with macro and weighted averages.
///
/// Undefined ratios (no predictions or no support) count as 0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassScores>,
    pub accuracy: f64,
    pub macro_avg: Averages,
    pub weighted_avg: Averages,
    pub support: usize,
}

impl ClassificationReport {
    pub fn from_confusion(cm: &ConfusionMatrix, names: &[String]) -> Self {
        let n = cm.num_classes();
        let total = cm.total();

        let classes: Vec<ClassScores> = (0..n)
            .map(|c| {
                let tp = cm.get(c, c) as f64;
                let predicted: usize = (0..n).map(|r| cm.get(r, c)).sum();
                let support: usize = cm.rows()[c].iter().sum();

                let precision = ratio(tp, predicted as f64);
                let recall = ratio(tp, support as f64);
                let f1 = ratio(2.0 * precision * recall, precision + recall);

                ClassScores {
                    name: names
                        .get(c)
                        .cloned()
                        .unwrap_or_else(|| c.to_string()),
                    precision,
                    recall,
                    f1,
                    support,
                }
            })
            .collect();

        let correct: usize = (0..n).map(|c| cm.get(c, c)).sum();

        let macro_avg = if n > 0 {
            Averages {
                precision: classes.iter().map(|c| c.precision).sum::<f64>() / n as f64,
                recall: classes.iter().map(|c| c.recall).sum::<f64>() / n as f64,
                f1: classes.iter().map(|c| c.f1).sum::<f64>() / n as f64,
            }
        } else {
            Averages::default()
        };

        let weighted = |f: fn(&ClassScores) -> f64| {
            ratio(
                classes.iter().map(|c| f(c) * c.support as f64).sum(),
                total as f64,
            )
        };
        let weighted_avg = Averages {
            precision: weighted(|c| c.precision),
            recall: weighted(|c| c.recall),
            f1: weighted(|c| c.f1),
        };

        ClassificationReport {
            accuracy: ratio(correct as f64, total as f64),
            classes,
            macro_avg,
            weighted_avg,
            support: total,
        }
    }
}

impl Default for Averages {
    fn default() -> Self {
        Averages {
            precision: 0.0,
            recall: 0.0,
            f1: 0.0,
        }
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|c| c.name.len())
            .chain(std::iter::once("weighted avg".len()))
            .max()
            .unwrap_or(0);

        writeln!(
            f,
            "{:>w$} {:>9} {:>9} {:>9} {:>9}",
            "",
            "precision",
            "recall",
            "f1-score",
            "support",
            w = width
        )?;
        writeln!(f)?;

        for c in &self.classes {
            writeln!(
                f,
                "{:>w$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                c.name,
                c.precision,
                c.recall,
                c.f1,
                c.support,
                w = width
            )?;
        }
        writeln!(f)?;

        writeln!(
            f,
            "{:>w$} {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy",
            "",
            "",
            self.accuracy,
            self.support,
            w = width
        )?;
        for (label, avg) in &[("macro avg", self.macro_avg), ("weighted avg", self.weighted_avg)] {
            writeln!(
                f,
                "{:>w$} {:>9.2} {:>9.2} {:>9.2} {:>9}",
                label,
                avg.precision,
                avg.recall,
                avg.f1,
                self.support,
                w = width
            )?;
        }

        Ok(())
    }
}

/// Mean categorical cross-entropy of predicted distributions.
pub fn cross_entropy(probabilities: &[Vec<f32>], truth: &[usize]) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }

    let total: f64 = probabilities
        .iter()
        .zip(truth.iter())
        .map(|(probs, t)| {
            let p = probs.get(*t).copied().unwrap_or(0.0) as f64;
            -p.max(1e-7).ln()
        })
        .sum();

    total / truth.len() as f64
}

/// Index of the largest value, `None` for an empty slice.
pub fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("class {}", i)).collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn confusion_counts_pairs() {
        let cm = ConfusionMatrix::from_predictions(&[0, 0, 1, 2, 2, 2], &[0, 1, 1, 2, 0, 5], 3);

        assert_eq!(cm.rows(), &[vec![1, 1, 0], vec![0, 1, 0], vec![1, 0, 1]][..]);
        assert_eq!(cm.total(), 5);
        assert_eq!(cm.max(), 1);
    }

    #[test]
    fn report_matches_hand_computation() {
        // truth:     0 0 0 1 1 2
        // predicted: 0 0 1 1 1 0
        let cm = ConfusionMatrix::from_predictions(&[0, 0, 0, 1, 1, 2], &[0, 0, 1, 1, 1, 0], 3);
        let report = ClassificationReport::from_confusion(&cm, &names(3));

        let c0 = &report.classes[0];
        assert!(close(c0.precision, 2.0 / 3.0));
        assert!(close(c0.recall, 2.0 / 3.0));
        assert!(close(c0.f1, 2.0 / 3.0));
        assert_eq!(c0.support, 3);

        let c1 = &report.classes[1];
        assert!(close(c1.precision, 2.0 / 3.0));
        assert!(close(c1.recall, 1.0));
        assert!(close(c1.f1, 0.8));

        let c2 = &report.classes[2];
        assert_eq!(c2.precision, 0.0);
        assert_eq!(c2.recall, 0.0);
        assert_eq!(c2.f1, 0.0);

        assert!(close(report.accuracy, 4.0 / 6.0));
        assert!(close(report.macro_avg.recall, (2.0 / 3.0 + 1.0) / 3.0));
        assert!(close(
            report.weighted_avg.f1,
            (2.0 / 3.0 * 3.0 + 0.8 * 2.0) / 6.0
        ));
        assert_eq!(report.support, 6);
    }

    #[test]
    fn empty_report_is_all_zero() {
        let cm = ConfusionMatrix::new(2);
        let report = ClassificationReport::from_confusion(&cm, &names(2));

        assert_eq!(report.accuracy, 0.0);
        assert_eq!(report.weighted_avg, Averages::default());
    }

    #[test]
    fn report_renders_every_class() {
        let cm = ConfusionMatrix::from_predictions(&[0, 1], &[0, 1], 2);
        let names = vec!["Pizza".to_string(), "Sushi Roll".to_string()];
        let text = ClassificationReport::from_confusion(&cm, &names).to_string();

        assert!(text.contains("Pizza"));
        assert!(text.contains("Sushi Roll"));
        assert!(text.contains("weighted avg"));
        assert!(text.contains("1.00"));
    }

    #[test]
    fn cross_entropy_clips_zero_probabilities() {
        let probs = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert!(close(cross_entropy(&probs, &[0, 1]), 0.0));

        let wrong = cross_entropy(&probs, &[1, 0]);
        assert!(close(wrong, -(1e-7f64).ln()));
    }

    #[test]
    fn argmax_picks_largest() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), Some(1));
        assert_eq!(argmax(&[]), None);
    }
}

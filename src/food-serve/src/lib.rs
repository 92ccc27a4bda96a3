use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

pub mod augment;
pub mod charts;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod labels;
pub mod metrics;
pub mod model;
pub mod nutrition;
pub mod service;
pub mod training;

pub use error::{Error, Result};
pub use labels::{ClassIndex, ClassMapping};
pub use model::{ImageClassifier, ModelArtifact, Predictor};
pub use nutrition::{NutritionClient, NutritionFacts, NutritionLookup};
pub use service::{ClassificationResult, ClassifyError, FoodService, Upload};

/// Input side of the networks, in pixels.
pub const IMG_SIZE: u32 = 224;

pub struct Timer {
    name: String,
    tstamp: Option<DateTime<Utc>>,
    duration: Option<Duration>,
}

impl Timer {
    /// Create a new timer
    pub fn new(name: &str) -> Self {
        Timer {
            name: name.to_owned(),
            tstamp: None,
            duration: None,
        }
    }

    pub fn new_start(name: &str) -> Self {
        let mut t = Timer::new(name);
        t.start();
        t
    }

    /// Start the timer
    pub fn start(&mut self) {
        info!("{}: starting", self.name);

        self.tstamp = Some(Utc::now());
        self.duration = None;
    }

    /// Stop the timer
    pub fn stop(&mut self) {
        match self.tstamp {
            None => debug!("{}: not running!", self.name),
            Some(tstamp) => {
                let d = Utc::now() - tstamp;

                self.duration = Some(d);
                self.tstamp = None;
                info!("{} duration: {} msec", self.name, d.num_milliseconds());
            }
        }
    }

    /// Get duration in milliseconds
    fn duration(&self) -> i64 {
        match self.duration {
            None => 0,
            Some(dur) => dur.num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Timer;

    #[test]
    fn timer_reports_zero_until_stopped() {
        let mut t = Timer::new_start("test");
        assert_eq!(t.duration(), 0);
        t.stop();
        assert!(t.duration() >= 0);

        // stopping twice keeps the first measurement
        let first = t.duration();
        t.stop();
        assert_eq!(t.duration(), first);
    }
}

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use log::{info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::task::{self, JoinError};
use uuid::Uuid;

use crate::labels::{ClassIndex, ClassMapping};
use crate::metrics::argmax;
use crate::model::Predictor;
use crate::nutrition::{NutritionClient, NutritionLookup};
use crate::Result;

/// Image part of a multipart request.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    /// Name the client gave the file, if any
    pub file_name: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub predicted_food: String,
    pub nutrition: NutritionLookup,
}

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Could not classify image")]
    Unclassifiable,

    #[error("Could not store upload: {0}")]
    Scratch(#[source] io::Error),

    #[error("Classification task failed: {0}")]
    Worker(#[from] JoinError),
}

/// Upload stored on disk, removed when dropped.
struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    fn create(dir: &Path, file_name: Option<&str>, bytes: &[u8]) -> io::Result<Self> {
        let mut name = Uuid::new_v4().to_string();
        if let Some(ext) = file_name.and_then(safe_extension) {
            name.push('.');
            name.push_str(ext);
        }

        let scratch = ScratchFile {
            path: dir.join(name),
        };
        fs::write(&scratch.path, bytes)?;
        Ok(scratch)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", self.path.display(), e);
            }
        }
    }
}

fn safe_extension(file_name: &str) -> Option<&str> {
    Path::new(file_name)
        .extension()
        .and_then(OsStr::to_str)
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
}

fn load_image(path: &Path) -> Result<DynamicImage> {
    Ok(image::io::Reader::open(path)?
        .with_guessed_format()?
        .decode()?)
}

pub struct FoodService {
    predictor: Box<dyn Predictor>,
    mapping: ClassMapping,
    index: ClassIndex,
    scratch_dir: PathBuf,
    nutrition: NutritionClient,
}

impl FoodService {
    /// Build the service, creating `scratch_dir` if it does not exist.
    pub fn new(
        predictor: Box<dyn Predictor>,
        mapping: ClassMapping,
        scratch_dir: &Path,
        nutrition: NutritionClient,
    ) -> Result<Self> {
        fs::create_dir_all(scratch_dir)?;

        Ok(FoodService {
            predictor,
            index: ClassIndex::from_mapping(&mapping),
            mapping,
            scratch_dir: scratch_dir.to_path_buf(),
            nutrition,
        })
    }

    pub fn mapping(&self) -> &ClassMapping {
        &self.mapping
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Class name of the image at `path`, `None` if it cannot be classified.
    pub fn identify(&self, path: &Path) -> Option<String> {
        if !path.exists() {
            return None;
        }

        let image = match load_image(path) {
            Ok(image) => image,
            Err(e) => {
                warn!("Could not decode {}: {}", path.display(), e);
                return None;
            }
        };

        let probabilities = match self.predictor.predict(&image) {
            Ok(p) => p,
            Err(e) => {
                warn!("Inference failed: {}", e);
                return None;
            }
        };

        let position = argmax(&probabilities)?;
        let name = self
            .index
            .class_id(position)
            .and_then(|id| self.mapping.name(id));
        if name.is_none() {
            warn!("Model output position {} has no class", position);
        }

        name.map(str::to_owned)
    }

    /// Store the upload, classify it and remove it again.
    pub fn recognize(&self, upload: &Upload) -> std::result::Result<String, ClassifyError> {
        let scratch = ScratchFile::create(
            &self.scratch_dir,
            upload.file_name.as_deref(),
            &upload.bytes,
        )
        .map_err(ClassifyError::Scratch)?;

        self.identify(scratch.path()).ok_or(ClassifyError::Unclassifiable)
    }

    /// Decoding and inference run on the blocking pool; the nutrition lookup
    /// starts only after the scratch file is gone.
    pub async fn classify(
        self: Arc<Self>,
        upload: Upload,
    ) -> std::result::Result<ClassificationResult, ClassifyError> {
        let service = Arc::clone(&self);
        let predicted_food = task::spawn_blocking(move || service.recognize(&upload)).await??;
        info!("Predicted food: {}", predicted_food);

        let nutrition = self.nutrition.lookup(&predicted_food).await;

        Ok(ClassificationResult {
            predicted_food,
            nutrition,
        })
    }
}

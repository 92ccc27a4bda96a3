use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use image::imageops::FilterType;
use image::DynamicImage;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tensorflow::train::{GradientDescentOptimizer, MinimizeOptions, Optimizer};
use tensorflow::{
    ops, DataType, Graph, Operation, Output, OutputName, SavedModelBuilder, SavedModelBundle,
    SavedModelSaver, Scope, Session, SessionOptions, SessionRunArgs, Shape, SignatureDef, Tensor,
    TensorInfo, Variable, DEFAULT_SERVING_SIGNATURE_DEF_KEY, PREDICT_METHOD_NAME,
};
use walkdir::WalkDir;

use crate::{Error, Result, Timer};

const SERVE_TAG: &str = "serve";
const FEATURES: &str = "features";
const KEEP_PROB: &str = "keep_prob";
const PROBABILITIES: &str = "probabilities";

/// Anything that turns an image into one probability per class position.
pub trait Predictor: Send + Sync {
    fn predict(&self, image: &DynamicImage) -> Result<Vec<f32>>;
}

/// Graph node a session feeds or fetches.
#[derive(Debug, Clone)]
struct Endpoint {
    name: String,
    index: i32,
}

impl Endpoint {
    fn from_info(info: &TensorInfo) -> Self {
        Endpoint {
            name: info.name().name.clone(),
            index: info.name().index,
        }
    }

    fn operation(&self, graph: &Graph) -> Result<Operation> {
        Ok(graph.operation_by_name_required(&self.name)?)
    }
}

/// Frozen pretrained feature extractor.
pub struct Backbone {
    /// TensorFlow model graph
    graph: Graph,

    /// TensorFlow session
    session: Session,

    input: Endpoint,
    output: Endpoint,
}

impl Backbone {
    pub fn load(export_dir: &Path) -> Result<Self> {
        if !export_dir.exists() {
            return Err(Error::ModelNotFound(export_dir.to_path_buf()));
        }

        let mut t = Timer::new_start("Loading backbone session");

        let mut graph = Graph::new();
        let bundle =
            SavedModelBundle::load(&SessionOptions::new(), &[SERVE_TAG], &mut graph, export_dir)?;

        let signature = bundle
            .meta_graph_def()
            .get_signature(DEFAULT_SERVING_SIGNATURE_DEF_KEY)?;
        let input = signature
            .inputs()
            .values()
            .next()
            .map(Endpoint::from_info)
            .ok_or_else(|| Error::InvalidArtifact("backbone signature has no input".into()))?;
        let output = signature
            .outputs()
            .values()
            .next()
            .map(Endpoint::from_info)
            .ok_or_else(|| Error::InvalidArtifact("backbone signature has no output".into()))?;

        t.stop();
        debug!("Backbone input {:?}, output {:?}", input, output);

        Ok(Backbone {
            graph,
            session: bundle.session,
            input,
            output,
        })
    }

    /// Run a NHWC batch through the extractor.
    pub fn features(&self, images: &[f32], batch: usize, image_size: u32) -> Result<Tensor<f32>> {
        let side = image_size as u64;
        let input = Tensor::<f32>::new(&[batch as u64, side, side, 3]).with_values(images)?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&self.input.operation(&self.graph)?, self.input.index, &input);
        let result = args.request_fetch(&self.output.operation(&self.graph)?, self.output.index);

        self.session.run(&mut args)?;
        Ok(args.fetch(result)?)
    }

    /// Shape of the feature map produced for one image, without the batch axis.
    pub fn feature_shape(&self, image_size: u32) -> Result<[u64; 3]> {
        let side = image_size as usize;
        let zeros = vec![0.0f32; side * side * 3];
        let features = self.features(&zeros, 1, image_size)?;

        match features.dims() {
            [_, h, w, c] => Ok([*h, *w, *c]),
            dims => Err(Error::InvalidArtifact(format!(
                "expected a 4-d feature map from the backbone, got {:?}",
                dims
            ))),
        }
    }
}

/// Probability rows of a `[batch, classes]` tensor.
fn rows(probabilities: &Tensor<f32>) -> Vec<Vec<f32>> {
    let classes = probabilities.dims().get(1).copied().unwrap_or(0) as usize;
    if classes == 0 {
        return Vec::new();
    }
    probabilities.chunks(classes).map(|row| row.to_vec()).collect()
}

/// Layer sizes and optimizer settings for a new head.
#[derive(Debug, Clone, Copy)]
pub struct HeadSpec {
    pub feature_shape: [u64; 3],
    pub hidden_units: u64,
    pub num_classes: u64,
    pub learning_rate: f32,
}

/// Output of one optimisation step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f32,
    pub probabilities: Vec<Vec<f32>>,
}

/// Classification head under training:
/// global average pooling, dense + ReLU, dropout, dense + softmax.
pub struct TrainableHead {
    scope: Scope,
    session: Session,
    saver: SavedModelSaver,
    features: Operation,
    labels: Operation,
    keep_prob: Operation,
    probabilities: Operation,
    loss: Operation,
    minimize: Operation,
    dropout: f32,
}

fn dense<O: Into<Output>>(
    input: O,
    input_size: u64,
    output_size: u64,
    name: &str,
    scope: &mut Scope,
) -> Result<(Vec<Variable>, Output)> {
    let mut scope = scope.new_sub_scope(name);
    let scope = &mut scope;

    // He initialisation
    let w_shape = ops::constant(&[input_size as i64, output_size as i64][..], scope)?;
    let stddev = ops::constant((2.0 / input_size as f32).sqrt(), scope)?;
    let w = Variable::builder()
        .initial_value(ops::mul(
            ops::RandomStandardNormal::new()
                .dtype(DataType::Float)
                .build(w_shape, scope)?,
            stddev,
            scope,
        )?)
        .data_type(DataType::Float)
        .shape([input_size, output_size])
        .build(&mut scope.with_op_name("w"))?;
    let b = Variable::builder()
        .const_initial_value(Tensor::<f32>::new(&[output_size]))
        .build(&mut scope.with_op_name("b"))?;

    let out = ops::add(
        ops::mat_mul(input, w.output().clone(), scope)?,
        b.output().clone(),
        scope,
    )?;

    Ok((vec![w, b], out.into()))
}

impl TrainableHead {
    pub fn build(spec: &HeadSpec, dropout: f32) -> Result<Self> {
        let mut scope = Scope::new_root_scope();
        let [h, w, c] = spec.feature_shape;

        let features = ops::Placeholder::new()
            .dtype(DataType::Float)
            .shape(Shape::from(Some(vec![
                None,
                Some(h as i64),
                Some(w as i64),
                Some(c as i64),
            ])))
            .build(&mut scope.with_op_name(FEATURES))?;
        let labels = ops::Placeholder::new()
            .dtype(DataType::Float)
            .shape(Shape::from(Some(vec![None, Some(spec.num_classes as i64)])))
            .build(&mut scope.with_op_name("labels"))?;
        let keep_prob = ops::Placeholder::new()
            .dtype(DataType::Float)
            .shape(Shape::from(Some(vec![])))
            .build(&mut scope.with_op_name(KEEP_PROB))?;

        let pooled = ops::mean(
            features.clone(),
            ops::constant(&[1i32, 2][..], &mut scope)?,
            &mut scope,
        )?;

        let (hidden_vars, hidden) = dense(pooled, c, spec.hidden_units, "hidden", &mut scope)?;
        let hidden = ops::relu(hidden, &mut scope)?;

        // keep each unit with probability keep_prob, scale survivors by 1/keep_prob
        let noise = ops::RandomUniform::new()
            .dtype(DataType::Float)
            .build(ops::shape(hidden.clone(), &mut scope)?, &mut scope)?;
        let mask = ops::floor(ops::add(keep_prob.clone(), noise, &mut scope)?, &mut scope)?;
        let dropped = ops::mul(
            ops::div(hidden, keep_prob.clone(), &mut scope)?,
            mask,
            &mut scope,
        )?;

        let (logit_vars, logits) = dense(
            dropped,
            spec.hidden_units,
            spec.num_classes,
            "logits",
            &mut scope,
        )?;
        let probabilities = ops::Softmax::new()
            .build(logits.clone(), &mut scope.with_op_name(PROBABILITIES))?;

        let xent = ops::softmax_cross_entropy_with_logits(logits, labels.clone(), &mut scope)?;
        let loss = ops::mean(
            Output {
                operation: xent,
                index: 0,
            },
            ops::constant(&[0i32][..], &mut scope)?,
            &mut scope,
        )?;

        let mut variables = hidden_vars;
        variables.extend(logit_vars);

        let optimizer =
            GradientDescentOptimizer::new(ops::constant(spec.learning_rate, &mut scope)?);
        let (optimizer_vars, minimize) = optimizer.minimize(
            &mut scope,
            loss.clone().into(),
            MinimizeOptions::default().with_variables(&variables),
        )?;

        let mut signature = SignatureDef::new(PREDICT_METHOD_NAME.to_string());
        signature.add_input_info(
            FEATURES.to_string(),
            TensorInfo::new(
                DataType::Float,
                Shape::from(None),
                OutputName {
                    name: features.name().map_err(tensorflow::Status::from)?,
                    index: 0,
                },
            ),
        );
        signature.add_input_info(
            KEEP_PROB.to_string(),
            TensorInfo::new(
                DataType::Float,
                Shape::from(None),
                OutputName {
                    name: keep_prob.name().map_err(tensorflow::Status::from)?,
                    index: 0,
                },
            ),
        );
        signature.add_output_info(
            PROBABILITIES.to_string(),
            TensorInfo::new(
                DataType::Float,
                Shape::from(None),
                OutputName {
                    name: probabilities.name().map_err(tensorflow::Status::from)?,
                    index: 0,
                },
            ),
        );

        let mut all_vars = variables.clone();
        all_vars.extend_from_slice(&optimizer_vars);

        let mut builder = SavedModelBuilder::new();
        builder
            .add_collection("train", &all_vars)
            .add_tag(SERVE_TAG)
            .add_signature(DEFAULT_SERVING_SIGNATURE_DEF_KEY, signature);
        let saver = builder.inject(&mut scope)?;

        let session = Session::new(&SessionOptions::new(), &scope.graph())?;

        let mut init = SessionRunArgs::new();
        for var in variables.iter().chain(optimizer_vars.iter()) {
            init.add_target(var.initializer());
        }
        session.run(&mut init)?;

        info!(
            "Built head: {:?} -> avg pool -> dense {} relu -> dropout {} -> dense {} softmax",
            spec.feature_shape, spec.hidden_units, dropout, spec.num_classes
        );

        Ok(TrainableHead {
            scope,
            session,
            saver,
            features,
            labels,
            keep_prob,
            probabilities,
            loss,
            minimize,
            dropout,
        })
    }

    /// One optimizer update on a batch of features and one-hot labels.
    pub fn train_step(&self, features: &Tensor<f32>, labels: &Tensor<f32>) -> Result<StepOutput> {
        let keep = Tensor::<f32>::new(&[]).with_values(&[1.0 - self.dropout])?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&self.features, 0, features);
        args.add_feed(&self.labels, 0, labels);
        args.add_feed(&self.keep_prob, 0, &keep);
        args.add_target(&self.minimize);
        let loss = args.request_fetch(&self.loss, 0);
        let probabilities = args.request_fetch(&self.probabilities, 0);

        self.session.run(&mut args)?;

        let loss: Tensor<f32> = args.fetch(loss)?;
        let probabilities: Tensor<f32> = args.fetch(probabilities)?;

        Ok(StepOutput {
            loss: loss[0],
            probabilities: rows(&probabilities),
        })
    }

    /// Forward pass without dropout.
    pub fn predict(&self, features: &Tensor<f32>) -> Result<Vec<Vec<f32>>> {
        let keep = Tensor::<f32>::new(&[]).with_values(&[1.0])?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&self.features, 0, features);
        args.add_feed(&self.keep_prob, 0, &keep);
        let probabilities = args.request_fetch(&self.probabilities, 0);

        self.session.run(&mut args)?;
        Ok(rows(&args.fetch(probabilities)?))
    }

    /// Export the head as a SavedModel, replacing any previous export.
    pub fn save(&self, export_dir: &Path) -> Result<()> {
        if export_dir.exists() {
            fs::remove_dir_all(export_dir)?;
        }
        if let Some(parent) = export_dir.parent() {
            fs::create_dir_all(parent)?;
        }

        self.saver
            .save(&self.session, &self.scope.graph(), export_dir)?;
        info!("Saved classification head to {}", export_dir.display());
        Ok(())
    }
}

/// Trained head loaded back from its SavedModel.
pub struct Head {
    graph: Graph,
    session: Session,
    features: Endpoint,
    keep_prob: Endpoint,
    probabilities: Endpoint,
}

impl Head {
    pub fn load(export_dir: &Path) -> Result<Self> {
        if !export_dir.exists() {
            return Err(Error::ModelNotFound(export_dir.to_path_buf()));
        }

        let mut t = Timer::new_start("Loading head session");

        let mut graph = Graph::new();
        let bundle =
            SavedModelBundle::load(&SessionOptions::new(), &[SERVE_TAG], &mut graph, export_dir)?;
        let signature = bundle
            .meta_graph_def()
            .get_signature(DEFAULT_SERVING_SIGNATURE_DEF_KEY)?;

        let features = Endpoint::from_info(signature.get_input(FEATURES)?);
        let keep_prob = Endpoint::from_info(signature.get_input(KEEP_PROB)?);
        let probabilities = Endpoint::from_info(signature.get_output(PROBABILITIES)?);

        t.stop();

        Ok(Head {
            graph,
            session: bundle.session,
            features,
            keep_prob,
            probabilities,
        })
    }

    pub fn predict(&self, features: &Tensor<f32>) -> Result<Vec<Vec<f32>>> {
        let keep = Tensor::<f32>::new(&[]).with_values(&[1.0])?;

        let mut args = SessionRunArgs::new();
        args.add_feed(
            &self.features.operation(&self.graph)?,
            self.features.index,
            features,
        );
        args.add_feed(
            &self.keep_prob.operation(&self.graph)?,
            self.keep_prob.index,
            &keep,
        );
        let result = args.request_fetch(
            &self.probabilities.operation(&self.graph)?,
            self.probabilities.index,
        );

        self.session.run(&mut args)?;
        Ok(rows(&args.fetch(result)?))
    }
}

/// Contents of `artifact.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Side of the square network input
    pub image_size: u32,
    /// Factor applied to raw channel values
    pub rescale: f32,
    /// Feature map shape the head was built for
    pub feature_shape: [u64; 3],
    pub num_classes: usize,
    pub created: DateTime<Utc>,
}

/// Directory holding a trained model: manifest, exported head and a copy of
/// the backbone it was trained on.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    dir: PathBuf,
    manifest: ArtifactManifest,
}

impl ModelArtifact {
    const MANIFEST: &'static str = "artifact.json";
    const HEAD: &'static str = "head";
    const BACKBONE: &'static str = "backbone";

    pub fn new(dir: &Path, manifest: ArtifactManifest) -> Self {
        ModelArtifact {
            dir: dir.to_path_buf(),
            manifest,
        }
    }

    /// Open an existing artifact. A missing directory or manifest means the
    /// model was never trained.
    pub fn open(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(Self::MANIFEST);
        if !manifest_path.is_file() {
            return Err(Error::ModelNotFound(dir.to_path_buf()));
        }

        let manifest: ArtifactManifest = serde_json::from_slice(&fs::read(&manifest_path)?)?;
        if manifest.num_classes == 0 {
            return Err(Error::InvalidArtifact(format!(
                "{} declares no classes",
                manifest_path.display()
            )));
        }

        Ok(ModelArtifact {
            dir: dir.to_path_buf(),
            manifest,
        })
    }

    pub fn write_manifest(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(
            self.dir.join(Self::MANIFEST),
            serde_json::to_vec_pretty(&self.manifest)?,
        )?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn head_dir(&self) -> PathBuf {
        self.dir.join(Self::HEAD)
    }

    pub fn backbone_dir(&self) -> PathBuf {
        self.dir.join(Self::BACKBONE)
    }

    /// Copy the backbone SavedModel at `source` into the artifact.
    pub fn install_backbone(&self, source: &Path) -> Result<()> {
        if !source.is_dir() {
            return Err(Error::ModelNotFound(source.to_path_buf()));
        }

        let target = self.backbone_dir();
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }

        for entry in WalkDir::new(source) {
            let entry = entry.map_err(std::io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| Error::InvalidArtifact(e.to_string()))?;
            let dest = target.join(relative);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)?;
            } else {
                fs::copy(entry.path(), &dest)?;
            }
        }

        debug!("Copied backbone {} to {}", source.display(), target.display());
        Ok(())
    }

    pub fn manifest(&self) -> &ArtifactManifest {
        &self.manifest
    }
}

/// Backbone and trained head, ready to classify images.
pub struct ImageClassifier {
    backbone: Backbone,
    head: Head,
    image_size: u32,
    rescale: f32,
    num_classes: usize,
}

impl ImageClassifier {
    pub fn load(model_dir: &Path) -> Result<Self> {
        let artifact = ModelArtifact::open(model_dir)?;
        let manifest = artifact.manifest();

        let backbone = Backbone::load(&artifact.backbone_dir())?;
        let head = Head::load(&artifact.head_dir())?;

        info!(
            "Loaded model from {} ({} classes)",
            model_dir.display(),
            manifest.num_classes
        );

        Ok(ImageClassifier {
            backbone,
            head,
            image_size: manifest.image_size,
            rescale: manifest.rescale,
            num_classes: manifest.num_classes,
        })
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Class probabilities for a NHWC batch of preprocessed images.
    pub fn run(&self, images: &[f32], batch: usize) -> Result<Vec<Vec<f32>>> {
        let mut t = Timer::new_start("Running session");

        let features = self.backbone.features(images, batch, self.image_size)?;
        let probabilities = self.head.predict(&features)?;

        t.stop();
        Ok(probabilities)
    }

    /// Resize to the network input and rescale channel values.
    pub fn preprocess(&self, image: &DynamicImage) -> Vec<f32> {
        let mut t = Timer::new_start("Resizing image");

        let rgb = image.to_rgb8();
        let resized = image::imageops::resize(
            &rgb,
            self.image_size,
            self.image_size,
            FilterType::Triangle,
        );

        let raw_image: Vec<f32> = resized
            .into_raw()
            .iter()
            .map(|x| *x as f32 * self.rescale)
            .collect();

        t.stop();
        raw_image
    }
}

impl Predictor for ImageClassifier {
    fn predict(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let raw_image = self.preprocess(image);
        let mut rows = self.run(&raw_image, 1)?;
        Ok(rows.pop().unwrap_or_default())
    }
}

/// Stand-in backbone for tests: scales every pixel by 2, so the feature map
/// has the shape of the input image.
#[cfg(test)]
pub(crate) fn save_scaling_backbone(export_dir: &Path) -> Result<()> {
    let mut scope = Scope::new_root_scope();

    let images = ops::Placeholder::new()
        .dtype(DataType::Float)
        .shape(Shape::from(Some(vec![None, None, None, Some(3)])))
        .build(&mut scope.with_op_name("images"))?;
    let scale = Variable::builder()
        .const_initial_value(Tensor::<f32>::new(&[]).with_values(&[2.0f32])?)
        .build(&mut scope.with_op_name("scale"))?;
    let feature_map = ops::mul(
        images.clone(),
        scale.output().clone(),
        &mut scope.with_op_name("feature_map"),
    )?;

    let mut signature = SignatureDef::new(PREDICT_METHOD_NAME.to_string());
    signature.add_input_info(
        "images".to_string(),
        TensorInfo::new(
            DataType::Float,
            Shape::from(None),
            OutputName {
                name: images.name().map_err(tensorflow::Status::from)?,
                index: 0,
            },
        ),
    );
    signature.add_output_info(
        "feature_map".to_string(),
        TensorInfo::new(
            DataType::Float,
            Shape::from(None),
            OutputName {
                name: feature_map.name().map_err(tensorflow::Status::from)?,
                index: 0,
            },
        ),
    );

    let mut builder = SavedModelBuilder::new();
    builder
        .add_collection("train", &[scale.clone()])
        .add_tag(SERVE_TAG)
        .add_signature(DEFAULT_SERVING_SIGNATURE_DEF_KEY, signature);
    let saver = builder.inject(&mut scope)?;

    let session = Session::new(&SessionOptions::new(), &scope.graph())?;
    let mut init = SessionRunArgs::new();
    init.add_target(scale.initializer());
    session.run(&mut init)?;

    saver.save(&session, &scope.graph(), export_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::argmax;

    fn manifest(num_classes: usize) -> ArtifactManifest {
        ArtifactManifest {
            image_size: 224,
            rescale: 1.0 / 255.0,
            feature_shape: [7, 7, 512],
            num_classes,
            created: Utc::now(),
        }
    }

    #[test]
    fn manifest_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("FoodClassifierNX_VGG16");

        let artifact = ModelArtifact::new(&model_dir, manifest(101));
        artifact.write_manifest().unwrap();

        let opened = ModelArtifact::open(&model_dir).unwrap();
        assert_eq!(opened.manifest(), artifact.manifest());
        assert_eq!(opened.head_dir(), model_dir.join("head"));
    }

    #[test]
    fn missing_artifact_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nothing-here");

        match ImageClassifier::load(&missing) {
            Err(Error::ModelNotFound(path)) => assert_eq!(path, missing),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("loaded a model that does not exist"),
        }
    }

    #[test]
    fn empty_manifest_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        ModelArtifact::new(dir.path(), manifest(0))
            .write_manifest()
            .unwrap();

        assert!(matches!(
            ModelArtifact::open(dir.path()),
            Err(Error::InvalidArtifact(_))
        ));
    }

    #[test]
    fn backbone_discovers_its_signature() {
        let dir = tempfile::tempdir().unwrap();
        let export = dir.path().join("vgg16_notop");
        save_scaling_backbone(&export).unwrap();

        let backbone = Backbone::load(&export).unwrap();
        assert_eq!(backbone.feature_shape(4).unwrap(), [4, 4, 3]);

        let features = backbone.features(&vec![0.5; 2 * 4 * 4 * 3], 2, 4).unwrap();
        assert_eq!(features.dims(), &[2, 4, 4, 3]);
        assert!(features.iter().all(|v| (*v - 1.0).abs() < 1e-6));

        assert!(matches!(
            Backbone::load(&dir.path().join("missing")),
            Err(Error::ModelNotFound(_))
        ));
    }

    #[test]
    fn artifact_is_self_contained() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("vgg16_notop");
        save_scaling_backbone(&source).unwrap();

        let built = dir.path().join("build").join("FoodClassifierNX_VGG16");
        let artifact = ModelArtifact::new(
            &built,
            ArtifactManifest {
                image_size: 4,
                rescale: 1.0 / 255.0,
                feature_shape: [4, 4, 3],
                num_classes: 2,
                created: Utc::now(),
            },
        );
        let head = TrainableHead::build(
            &HeadSpec {
                feature_shape: [4, 4, 3],
                hidden_units: 8,
                num_classes: 2,
                learning_rate: 0.1,
            },
            0.5,
        )
        .unwrap();
        head.save(&artifact.head_dir()).unwrap();
        artifact.install_backbone(&source).unwrap();
        artifact.write_manifest().unwrap();

        // neither the original backbone nor the build location survive
        let moved = dir.path().join("FoodClassifierNX_VGG16");
        fs::rename(&built, &moved).unwrap();
        fs::remove_dir_all(&source).unwrap();

        let classifier = ImageClassifier::load(&moved).unwrap();
        assert_eq!(classifier.num_classes(), 2);
        assert_eq!(classifier.image_size(), 4);

        let image = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            10,
            7,
            image::Rgb([255, 128, 0]),
        ));
        let pixels = classifier.preprocess(&image);
        assert_eq!(pixels.len(), 4 * 4 * 3);
        assert!((pixels[0] - 1.0).abs() < 1e-6);
        assert_eq!(pixels[2], 0.0);

        let probabilities = classifier.predict(&image).unwrap();
        assert_eq!(probabilities.len(), 2);
        let sum: f32 = probabilities.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4);
    }

    fn spec() -> HeadSpec {
        HeadSpec {
            feature_shape: [2, 2, 3],
            hidden_units: 16,
            num_classes: 3,
            learning_rate: 0.5,
        }
    }

    /// Each class lights up one channel of the feature map.
    fn separable_batch() -> (Tensor<f32>, Tensor<f32>) {
        let mut features = Vec::new();
        let mut labels = Vec::new();
        for class in 0..3 {
            for _ in 0..4 {
                features.push(if class == 0 { 1.0 } else { 0.0 });
                features.push(if class == 1 { 1.0 } else { 0.0 });
                features.push(if class == 2 { 1.0 } else { 0.0 });
            }
            for i in 0..3 {
                labels.push(if i == class { 1.0 } else { 0.0 });
            }
        }

        (
            Tensor::<f32>::new(&[3, 2, 2, 3]).with_values(&features).unwrap(),
            Tensor::<f32>::new(&[3, 3]).with_values(&labels).unwrap(),
        )
    }

    #[test]
    fn head_learns_separable_features() {
        let head = TrainableHead::build(&spec(), 0.0).unwrap();
        let (features, labels) = separable_batch();

        let first = head.train_step(&features, &labels).unwrap();
        assert_eq!(first.probabilities.len(), 3);

        let mut last = first.loss;
        for _ in 0..200 {
            last = head.train_step(&features, &labels).unwrap().loss;
        }
        assert!(last < first.loss, "loss {} did not drop below {}", last, first.loss);

        let predicted: Vec<usize> = head
            .predict(&features)
            .unwrap()
            .iter()
            .map(|row| argmax(row).unwrap())
            .collect();
        assert_eq!(predicted, vec![0, 1, 2]);
    }

    #[test]
    fn saved_head_predicts_like_the_trained_one() {
        let dir = tempfile::tempdir().unwrap();
        let export = dir.path().join("head");

        let head = TrainableHead::build(&spec(), 0.5).unwrap();
        let (features, labels) = separable_batch();
        for _ in 0..50 {
            head.train_step(&features, &labels).unwrap();
        }
        let before = head.predict(&features).unwrap();
        head.save(&export).unwrap();

        let loaded = Head::load(&export).unwrap();
        let after = loaded.predict(&features).unwrap();

        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            let sum: f32 = b.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((x - y).abs() < 1e-5);
            }
        }
    }
}

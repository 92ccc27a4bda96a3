use std::error::Error;
use std::path::PathBuf;
use structopt::StructOpt;

use food_serve::training::{self, TrainingConfig, TrainingPaths};
use food_serve::{ClassMapping, Timer};

use log::info;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "food-train",
    about = "Train the food classifier head on top of a frozen VGG16 backbone"
)]
struct CmdArgs {
    #[structopt(help = "Export directory of the pretrained VGG16 (no top) SavedModel")]
    backbone_dir: String,

    #[structopt(
        long,
        default_value = "FOOD101",
        help = "Dataset root with one folder per class id"
    )]
    dataset_dir: String,

    #[structopt(
        long,
        default_value = "FOOD101/Classes.txt",
        help = "Path to class id / name file"
    )]
    classes: String,

    #[structopt(
        long,
        default_value = "FoodClassifierNX_VGG16",
        help = "Where to save the trained model artifact"
    )]
    model_dir: String,

    #[structopt(
        long,
        default_value = ".",
        help = "Directory for charts, history and reports"
    )]
    output_dir: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = CmdArgs::from_args();

    let mapping = ClassMapping::load(&PathBuf::from(&args.classes))?;
    info!("Loaded {} classes from {}", mapping.len(), args.classes);

    let paths = TrainingPaths {
        dataset_dir: PathBuf::from(args.dataset_dir),
        backbone_dir: PathBuf::from(args.backbone_dir),
        model_dir: PathBuf::from(args.model_dir),
        output_dir: PathBuf::from(args.output_dir),
    };

    let mut t = Timer::new_start("Training");
    let outcome = training::train(&paths, &mapping, &TrainingConfig::default())?;
    t.stop();

    info!(
        "Trained {} epochs, final validation accuracy {:.4}",
        outcome.history.epochs(),
        outcome.report.accuracy
    );
    info!("Model artifact: {}", outcome.artifact.dir().display());

    Ok(())
}

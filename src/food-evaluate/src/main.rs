use std::error::Error;
use std::path::PathBuf;
use structopt::StructOpt;

use food_serve::evaluation;
use food_serve::{ClassMapping, ImageClassifier};

use log::info;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "food-evaluate",
    about = "Evaluate a trained food classifier on the validation split"
)]
struct CmdArgs {
    #[structopt(
        long,
        default_value = "FoodClassifierNX_VGG16",
        help = "Directory of the trained model artifact"
    )]
    model_dir: String,

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
        default_value = ".",
        help = "Directory for the confusion matrix and report"
    )]
    output_dir: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = CmdArgs::from_args();

    let classifier = ImageClassifier::load(&PathBuf::from(&args.model_dir))?;
    let mapping = ClassMapping::load(&PathBuf::from(&args.classes))?;

    let result = evaluation::evaluate(
        &classifier,
        &PathBuf::from(&args.dataset_dir),
        &mapping,
        &PathBuf::from(&args.output_dir),
    )?;

    info!(
        "Evaluated {} images: loss {:.4}, accuracy {:.2}%",
        result.report.support,
        result.loss,
        result.accuracy * 100.0
    );

    Ok(())
}

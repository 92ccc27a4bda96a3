use std::convert::Infallible;
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use food_serve::{ClassMapping, FoodService, ImageClassifier, NutritionClient};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use log::{error, info};
use structopt::StructOpt;

mod handler;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "food-api",
    about = "HTTP service that recognises food in images and looks up its nutrition facts"
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
        default_value = "FOOD101/Classes.txt",
        help = "Path to class id / name file"
    )]
    classes: String,

    #[structopt(
        long,
        default_value = "uploads",
        help = "Scratch directory for uploaded images"
    )]
    uploads: String,

    #[structopt(long, default_value = "0.0.0.0", help = "Address to listen on")]
    host: IpAddr,

    #[structopt(long, default_value = "5000", help = "Port to listen on")]
    port: u16,

    #[structopt(
        long,
        default_value = "https://world.openfoodfacts.org",
        help = "Base URL of the OpenFoodFacts API"
    )]
    nutrition_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = CmdArgs::from_args();

    let model_dir = PathBuf::from(&args.model_dir);
    let classifier = match ImageClassifier::load(&model_dir) {
        Ok(classifier) => classifier,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    info!("Model loaded successfully!");

    let mapping = ClassMapping::load(&PathBuf::from(&args.classes))?;
    info!("Loaded {} classes from {}", mapping.len(), args.classes);

    let service = Arc::new(FoodService::new(
        Box::new(classifier),
        mapping,
        &PathBuf::from(&args.uploads),
        NutritionClient::with_base_url(&args.nutrition_url),
    )?);

    // A `MakeService` that produces a `Service` to handle each connection.
    let make_service = make_service_fn(move |_conn: &AddrStream| {
        let service = Arc::clone(&service);

        let svc = service_fn(move |req| handler::handle(req, service.clone()));

        async move { Ok::<_, Infallible>(svc) }
    });

    let addr = SocketAddr::new(args.host, args.port);
    let server = Server::bind(&addr).serve(make_service);
    info!("Listening on http://{}", addr);

    if let Err(e) = server.await {
        error!("server error: {}", e);
    }

    Ok(())
}

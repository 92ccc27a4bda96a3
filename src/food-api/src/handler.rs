use std::convert::Infallible;
use std::sync::Arc;

use food_serve::{ClassifyError, FoodService, Upload};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Method, Request, Response, StatusCode};
use log::{error, warn};
use multer::{Constraints, Multipart, SizeLimit};
use serde::Serialize;
use serde_json::json;

const IMAGE_FIELD: &str = "image";

/// Largest accepted image part, in bytes.
const MAX_IMAGE_BYTES: u64 = 16 * 1024 * 1024;

pub async fn handle(
    req: Request<Body>,
    service: Arc<FoodService>,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/classify") => classify(req, service).await,
        _ => json_error(StatusCode::NOT_FOUND, "Not found"),
    };

    Ok(response)
}

async fn classify(req: Request<Body>, service: Arc<FoodService>) -> Response<Body> {
    let upload = match image_field(req, MAX_IMAGE_BYTES).await {
        Ok(upload) => upload,
        Err(Rejection::Missing) => {
            return json_error(StatusCode::BAD_REQUEST, "No image provided")
        }
        Err(Rejection::TooLarge) => {
            return json_error(StatusCode::PAYLOAD_TOO_LARGE, "Image too large")
        }
    };

    match service.classify(upload).await {
        Ok(result) => json_response(StatusCode::OK, &result),
        Err(ClassifyError::Unclassifiable) => {
            json_error(StatusCode::BAD_REQUEST, "Could not classify image")
        }
        Err(e) => {
            error!("{}", e);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

#[derive(Debug, PartialEq)]
enum Rejection {
    Missing,
    TooLarge,
}

impl From<multer::Error> for Rejection {
    fn from(e: multer::Error) -> Self {
        match e {
            multer::Error::FieldSizeExceeded { .. } | multer::Error::StreamSizeExceeded { .. } => {
                warn!("Rejected upload: {}", e);
                Rejection::TooLarge
            }
            e => {
                warn!("Malformed multipart body: {}", e);
                Rejection::Missing
            }
        }
    }
}

/// The `image` part of a multipart body. Anything else, including a body
/// that is not multipart at all, counts as no image.
async fn image_field(req: Request<Body>, limit: u64) -> Result<Upload, Rejection> {
    let boundary = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .and_then(|ct| multer::parse_boundary(ct).ok())
        .ok_or(Rejection::Missing)?;

    let constraints = Constraints::new().size_limit(SizeLimit::new().per_field(limit));
    let mut multipart = Multipart::with_constraints(req.into_body(), boundary, constraints);

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let file_name = field.file_name().map(str::to_owned);
        let bytes = field.bytes().await?;
        return Ok(Upload {
            file_name,
            bytes: bytes.to_vec(),
        });
    }

    Err(Rejection::Missing)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let (status, body) = match serde_json::to_vec(body) {
        Ok(json) => (status, Body::from(json)),
        Err(e) => {
            error!("Could not serialize response: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Body::from(r#"{"error":"Internal server error"}"#),
            )
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &json!({ "error": message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use food_serve::{ClassMapping, NutritionClient, Predictor};
    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
    use serde_json::Value;
    use std::fs;
    use std::io::Cursor;
    use std::path::Path;

    const BOUNDARY: &str = "X-FOOD-BOUNDARY";

    struct Fixed(Vec<f32>);

    impl Predictor for Fixed {
        fn predict(&self, _image: &DynamicImage) -> food_serve::Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn service(probabilities: Vec<f32>, scratch: &Path) -> Arc<FoodService> {
        Arc::new(
            FoodService::new(
                Box::new(Fixed(probabilities)),
                ClassMapping::parse("0 Pizza\n1 Ramen\n"),
                scratch,
                NutritionClient::with_base_url("http://127.0.0.1:1"),
            )
            .unwrap(),
        )
    }

    fn png() -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([120, 80, 20])))
            .write_to(&mut bytes, ImageOutputFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn multipart(field: &str, file_name: &str, bytes: &[u8]) -> Request<Body> {
        let mut body = format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n",
            BOUNDARY, field, file_name
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        Request::builder()
            .method(Method::POST)
            .uri("/classify")
            .header(
                CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(req: Request<Body>, service: Arc<FoodService>) -> (StatusCode, Value) {
        let response = handle(req, service).await.unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn entries(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn classifies_upload() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(vec![0.6, 0.4], dir.path());

        let (status, body) = send(multipart("image", "pizza.png", &png()), svc).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "predicted_food": "Pizza",
                "nutrition": {"error": "Product not found"}
            })
        );
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn missing_image_field() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(vec![1.0, 0.0], dir.path());

        let (status, body) = send(multipart("photo", "pizza.png", &png()), svc.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No image provided"}));

        let not_multipart = Request::builder()
            .method(Method::POST)
            .uri("/classify")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(not_multipart, svc).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No image provided"}));

        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn unclassifiable_images() {
        let dir = tempfile::tempdir().unwrap();

        let (status, body) = send(
            multipart("image", "notes.txt", b"definitely not pixels"),
            service(vec![1.0, 0.0], dir.path()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Could not classify image"}));

        // position 2 has no class in a two-line label file
        let (status, body) = send(
            multipart("image", "pizza.png", &png()),
            service(vec![0.1, 0.2, 0.7], dir.path()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Could not classify image"}));

        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn oversized_image_is_rejected() {
        let req = multipart("image", "huge.png", &vec![7u8; 4096]);
        assert_eq!(image_field(req, 1024).await.unwrap_err(), Rejection::TooLarge);

        let req = multipart("image", "small.png", &[1, 2, 3]);
        let upload = image_field(req, 1024).await.unwrap();
        assert_eq!(upload.bytes, vec![1, 2, 3]);
        assert_eq!(upload.file_name.as_deref(), Some("small.png"));
    }

    #[tokio::test]
    async fn scratch_write_failure_is_a_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("uploads");
        let svc = service(vec![1.0, 0.0], &scratch);
        fs::remove_dir(&scratch).unwrap();

        let (status, body) = send(multipart("image", "pizza.png", &png()), svc).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": "Internal server error"}));
    }

    #[tokio::test]
    async fn unknown_routes() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(vec![1.0, 0.0], dir.path());

        for (method, uri) in &[(Method::GET, "/classify"), (Method::POST, "/upload")] {
            let req = Request::builder()
                .method(method.clone())
                .uri(*uri)
                .body(Body::empty())
                .unwrap();

            let (status, body) = send(req, svc.clone()).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body, json!({"error": "Not found"}));
        }
    }
}

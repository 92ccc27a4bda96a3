use log::{debug, warn};
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::Result;

pub const OPEN_FOOD_FACTS: &str = "https://world.openfoodfacts.org";
pub const NOT_AVAILABLE: &str = "N/A";
pub const PRODUCT_NOT_FOUND: &str = "Product not found";

/// A field as reported by the API, or the `"N/A"` sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum Reported {
    Value(Value),
    NotAvailable,
}

impl Reported {
    fn field(object: Option<&Value>, key: &str) -> Self {
        match object.and_then(|o| o.get(key)) {
            Some(Value::Null) | None => Reported::NotAvailable,
            Some(v) => Reported::Value(v.clone()),
        }
    }
}

impl Serialize for Reported {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Reported::Value(v) => v.serialize(serializer),
            Reported::NotAvailable => serializer.serialize_str(NOT_AVAILABLE),
        }
    }
}

/// Per-100g nutrition values of a product.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NutritionFacts {
    pub product_name: Reported,
    pub calories: Reported,
    pub proteins: Reported,
    pub carbohydrates: Reported,
    pub fats: Reported,
}

impl NutritionFacts {
    /// Extract the fields from a `product` object.
    pub fn from_product(product: &Value) -> Self {
        let nutriments = product.get("nutriments");

        NutritionFacts {
            product_name: Reported::field(Some(product), "product_name"),
            calories: Reported::field(nutriments, "energy-kcal_100g"),
            proteins: Reported::field(nutriments, "proteins_100g"),
            carbohydrates: Reported::field(nutriments, "carbohydrates_100g"),
            fats: Reported::field(nutriments, "fat_100g"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NutritionLookup {
    Found(NutritionFacts),
    NotFound { error: &'static str },
}

impl NutritionLookup {
    pub fn not_found() -> Self {
        NutritionLookup::NotFound {
            error: PRODUCT_NOT_FOUND,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, NutritionLookup::Found(_))
    }
}

#[derive(Debug, Clone)]
pub struct NutritionClient {
    http: reqwest::Client,
    base_url: String,
}

impl Default for NutritionClient {
    fn default() -> Self {
        NutritionClient::new()
    }
}

impl NutritionClient {
    pub fn new() -> Self {
        NutritionClient::with_base_url(OPEN_FOOD_FACTS)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        NutritionClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn lookup(&self, term: &str) -> NutritionLookup {
        match self.fetch(term).await {
            Ok(Some(facts)) => NutritionLookup::Found(facts),
            Ok(None) => {
                debug!("No product matches '{}'", term);
                NutritionLookup::not_found()
            }
            Err(e) => {
                warn!("Nutrition lookup for '{}' failed: {}", term, e);
                NutritionLookup::not_found()
            }
        }
    }

    async fn fetch(&self, term: &str) -> Result<Option<NutritionFacts>> {
        let search: Value = self
            .http
            .get(format!("{}/cgi/search.pl", self.base_url))
            .query(&[("search_terms", term), ("search_simple", "1"), ("json", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let code = match search
            .get("products")
            .and_then(Value::as_array)
            .and_then(|products| products.first())
            .and_then(|product| product.get("code"))
            .and_then(product_code)
        {
            Some(code) => code,
            None => return Ok(None),
        };

        let record: Value = self
            .http
            .get(format!("{}/api/v0/product/{}.json", self.base_url, code))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(record
            .get("product")
            .filter(|product| product.is_object())
            .map(NutritionFacts::from_product))
    }
}

/// Barcodes come back as strings or numbers; only plain alphanumerics make it
/// into the product URL.
fn product_code(code: &Value) -> Option<String> {
    match code {
        Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric()) => {
            Some(s.clone())
        }
        Value::Number(n) if n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server};
    use serde_json::json;
    use std::convert::Infallible;
    use std::net::SocketAddr;

    /// Serve `route(path_and_query)` on an ephemeral local port.
    async fn stub(route: fn(&str) -> (u16, String)) -> String {
        let make = make_service_fn(move |_conn| async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| async move {
                let target = req
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str().to_owned())
                    .unwrap_or_default();
                let (status, body) = route(&target);
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(status)
                        .header("content-type", "application/json")
                        .body(Body::from(body))
                        .unwrap(),
                )
            }))
        });

        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let server = Server::bind(&addr).serve(make);
        let url = format!("http://{}", server.local_addr());
        tokio::spawn(server);
        url
    }

    fn pizza(target: &str) -> (u16, String) {
        if target.starts_with("/cgi/search.pl")
            && target.contains("search_terms=Pizza")
            && target.contains("search_simple=1")
            && target.contains("json=1")
        {
            (200, json!({"products": [{"code": "3017620422003"}]}).to_string())
        } else if target == "/api/v0/product/3017620422003.json" {
            let product = json!({
                "product": {
                    "product_name": "Margherita",
                    "nutriments": {
                        "energy-kcal_100g": 250,
                        "proteins_100g": 11.2,
                        "fat_100g": 9
                    }
                }
            });
            (200, product.to_string())
        } else {
            (404, "{}".to_string())
        }
    }

    #[tokio::test]
    async fn found_product_reports_missing_fields_as_na() {
        let client = NutritionClient::with_base_url(&stub(pizza).await);

        let lookup = client.lookup("Pizza").await;

        assert!(lookup.is_found());
        assert_eq!(
            serde_json::to_value(&lookup).unwrap(),
            json!({
                "product_name": "Margherita",
                "calories": 250,
                "proteins": 11.2,
                "carbohydrates": "N/A",
                "fats": 9
            })
        );
    }

    fn numeric_code(target: &str) -> (u16, String) {
        if target.starts_with("/cgi/search.pl") {
            (200, json!({"products": [{"code": 42}, {"code": "7"}]}).to_string())
        } else if target == "/api/v0/product/42.json" {
            (200, json!({"product": {"product_name": "Tacos"}}).to_string())
        } else {
            (404, "{}".to_string())
        }
    }

    #[tokio::test]
    async fn numeric_codes_are_accepted() {
        let client = NutritionClient::with_base_url(&stub(numeric_code).await);

        match client.lookup("Tacos").await {
            NutritionLookup::Found(facts) => {
                assert_eq!(facts.product_name, Reported::Value(json!("Tacos")));
                assert_eq!(facts.calories, Reported::NotAvailable);
            }
            other => panic!("expected a product, got {:?}", other),
        }
    }

    fn no_results(_: &str) -> (u16, String) {
        (200, json!({"count": 0, "products": []}).to_string())
    }

    fn server_error(_: &str) -> (u16, String) {
        (500, "oops".to_string())
    }

    fn no_product(target: &str) -> (u16, String) {
        if target.starts_with("/cgi/search.pl") {
            (200, json!({"products": [{"code": "123"}]}).to_string())
        } else {
            (200, json!({"status": 0, "status_verbose": "product not found"}).to_string())
        }
    }

    fn unsafe_code(target: &str) -> (u16, String) {
        if target.starts_with("/cgi/search.pl") {
            (200, json!({"products": [{"code": "../admin"}]}).to_string())
        } else {
            (200, json!({"product": {"product_name": "nope"}}).to_string())
        }
    }

    #[tokio::test]
    async fn failures_degrade_to_not_found() {
        let routes: [fn(&str) -> (u16, String); 4] =
            [no_results, server_error, no_product, unsafe_code];

        for route in routes.iter() {
            let client = NutritionClient::with_base_url(&stub(*route).await);
            let lookup = client.lookup("Ramen").await;

            assert_eq!(lookup, NutritionLookup::not_found());
            assert_eq!(
                serde_json::to_value(&lookup).unwrap(),
                json!({"error": "Product not found"})
            );
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_not_found() {
        let client = NutritionClient::with_base_url("http://127.0.0.1:1/");
        assert_eq!(client.base_url(), "http://127.0.0.1:1");

        assert_eq!(client.lookup("Sushi").await, NutritionLookup::not_found());
    }

    #[test]
    fn product_without_nutriments() {
        let facts = NutritionFacts::from_product(&json!({"product_name": null}));

        assert_eq!(
            serde_json::to_value(&facts).unwrap(),
            json!({
                "product_name": "N/A",
                "calories": "N/A",
                "proteins": "N/A",
                "carbohydrates": "N/A",
                "fats": "N/A"
            })
        );
    }
}

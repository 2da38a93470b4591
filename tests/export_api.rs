mod common;

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose};
use card_renderer::core::usage::UsageLogger;
use card_renderer::settings::Config;
use card_renderer::{AppState, init_openapi_route};
use common::*;
use poem::http::{StatusCode, header::CONTENT_DISPOSITION};
use poem::test::TestClient;
use serde_json::{Value, json};

fn fetcher() -> MemoryFetcher {
    MemoryFetcher::new()
        .image(&asset("/assets/bg.png"), solid_png(8, 8, [30, 30, 30, 255]))
        .image(&asset("/assets/avatar.png"), solid_png(8, 8, [200, 10, 10, 255]))
}

fn client() -> TestClient<impl poem::Endpoint> {
    client_with(fetcher())
}

fn client_with(fetcher: MemoryFetcher) -> TestClient<impl poem::Endpoint> {
    let app_state = Arc::new(AppState {
        engine: Arc::new(canvas_engine(fetcher)),
        usage: UsageLogger::disabled(),
    });
    TestClient::new(init_openapi_route(app_state, &Config::default()))
}

fn card_json(id: &str) -> Value {
    serde_json::to_value(business_card(id)).unwrap()
}

async fn body_json(resp: poem::test::TestResponse) -> Value {
    let body = resp.0.into_body().into_string().await.unwrap();
    serde_json::from_str(&body).unwrap()
}

#[tokio::test]
async fn health_reports_backend() {
    let cli = client();
    let resp = cli.get("/health").send().await;
    resp.assert_status_is_ok();

    let health = body_json(resp).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["backend"], "canvas");
    assert_eq!(health["in_flight"], 0);
}

#[tokio::test]
async fn export_returns_png_attachment() {
    let cli = client();
    let resp = cli
        .post("/export")
        .body_json(&json!({
            "card": card_json("card-1"),
            "options": { "format": "png", "variant": "front" },
            "user": { "id": "u-1", "display_name": "Jordan Lee" }
        }))
        .send()
        .await;

    resp.assert_status_is_ok();
    resp.assert_content_type("image/png");
    let disposition = resp
        .0
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(disposition.contains("Jordan-Lee-front.png"), "{}", disposition);

    let bytes = resp.0.into_body().into_vec().await.unwrap();
    assert_eq!(decode(&bytes).dimensions(), (700, 1000));
}

#[tokio::test]
async fn export_returns_base64_payload() {
    let cli = client();
    let resp = cli
        .post("/export")
        .body_json(&json!({
            "card": card_json("card-2"),
            "options": { "format": "jpg", "scale": 1, "return_base64": true }
        }))
        .send()
        .await;
    resp.assert_status_is_ok();

    let body = body_json(resp).await;
    assert_eq!(body["mime_type"], "image/jpeg");
    assert_eq!(body["filename"], "business-card-card.jpg");
    assert_eq!(body["pixel_width"], 350);
    assert_eq!(body["pixel_height"], 500);
    assert_eq!(body["backend"], "canvas");

    let bytes = general_purpose::STANDARD
        .decode(body["data"].as_str().unwrap())
        .unwrap();
    assert_eq!(bytes.len() as u64, body["byte_size"].as_u64().unwrap());
    assert_eq!(
        image::load_from_memory(&bytes).unwrap().to_rgb8().dimensions(),
        (350, 500)
    );
}

#[tokio::test]
async fn missing_card_is_not_found() {
    let cli = client();
    let resp = cli
        .post("/export")
        .body_json(&json!({ "options": {} }))
        .send()
        .await;
    resp.assert_status(StatusCode::NOT_FOUND);

    let body = body_json(resp).await;
    assert_eq!(body["kind"], "element_not_found");
    assert_eq!(body["stage"], "idle");
}

#[tokio::test]
async fn invalid_options_are_bad_requests() {
    let cli = client();
    let resp = cli
        .post("/export")
        .body_json(&json!({
            "card": card_json("card-3"),
            "options": { "format": "gif" }
        }))
        .send()
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(body_json(resp).await["kind"], "invalid_request");
}

#[tokio::test]
async fn tainted_card_is_unprocessable() {
    let cli = client_with(
        fetcher().image("https://cdn.other.net/bg.png", solid_png(8, 8, [0, 0, 0, 255])),
    );
    let mut card = card_json("card-4");
    card["layers"][0]["content"] = json!("https://cdn.other.net/bg.png");

    let resp = cli
        .post("/export")
        .body_json(&json!({ "card": card }))
        .send()
        .await;
    resp.assert_status(StatusCode::UNPROCESSABLE_ENTITY);

    let body = body_json(resp).await;
    assert_eq!(body["kind"], "rasterization_error");
    assert_eq!(body["stage"], "rasterizing");
    assert!(body["hint"].as_str().unwrap().contains("proxy"));
}

#[tokio::test]
async fn unreachable_image_is_reported_as_warning() {
    let cli = client();
    let mut card = card_json("card-5");
    card["layers"][0]["content"] = json!("https://cdn.other.net/missing.png");

    let resp = cli
        .post("/export")
        .body_json(&json!({ "card": card, "options": { "return_base64": true } }))
        .send()
        .await;
    resp.assert_status_is_ok();

    let body = body_json(resp).await;
    assert_eq!(body["warnings"][0]["url"], "https://cdn.other.net/missing.png");
    assert_eq!(body["warnings"][0]["kind"], "image");
}

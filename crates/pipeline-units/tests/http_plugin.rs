//! HttpPluginUnit against a local fake plugin server

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use pipeline_core::{Context, FieldSpec, HandleId, UnitConfig, UnitError, UnitRequest, ValueKind, WorkUnit};
use pipeline_units::{HttpPluginConfig, HttpPluginUnit};
use serde_json::{json, Map, Value};
use std::time::Duration;

async fn transcribe(Json(body): Json<Value>) -> Json<Value> {
    let dir = body["inputs"]["input_dir"]["path"].as_str().unwrap_or("?");
    Json(json!({
        "output_type": "batchtext",
        "texts": [{"output_type": "text", "value": format!("transcript of {dir}")}],
    }))
}

async fn summarize(Json(body): Json<Value>) -> Json<Value> {
    let model = body["parameters"]["model"].as_str().unwrap_or("default");
    Json(json!({"output_type": "directory", "path": format!("/summaries/{model}")}))
}

async fn broken() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "model crashed")
}

async fn slow(Json(_): Json<Value>) -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(30)).await;
    Json(json!({"path": "/late"}))
}

/// Start the fake server and return its base URL
async fn spawn_server() -> String {
    let app = Router::new()
        .route("/audio/transcribe", post(transcribe))
        .route("/text_summarization/summarize", post(summarize))
        .route("/broken", post(broken))
        .route("/slow", post(slow));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn unit(base_url: &str, route: &str, output: ValueKind) -> HttpPluginUnit {
    let config = HttpPluginConfig::new(
        UnitConfig::new(
            route.trim_start_matches('/'),
            vec![
                FieldSpec::required("input_dir", ValueKind::Path),
                FieldSpec::optional("model", ValueKind::Text),
            ],
            output,
        ),
        base_url,
        route,
    )
    .with_parameters(&["model"]);
    HttpPluginUnit::new(config).unwrap()
}

fn request(model: Option<&str>) -> UnitRequest {
    let mut params = Map::new();
    if let Some(model) = model {
        params.insert("model".to_string(), json!(model));
    }
    UnitRequest::new(params).with_piped("input_dir", json!("/data/audio"))
}

#[tokio::test]
async fn test_transcribe_returns_first_text() {
    let base = spawn_server().await;
    let unit = unit(&base, "/audio/transcribe", ValueKind::Text);
    let ctx = Context::new(HandleId::new(), 0);

    let value = unit.execute(&ctx, request(None)).await.unwrap();
    assert_eq!(value, json!("transcript of /data/audio"));
}

#[tokio::test]
async fn test_summarize_returns_path_and_sends_parameters() {
    let base = spawn_server().await;
    let unit = unit(&base, "/text_summarization/summarize", ValueKind::Path);
    let ctx = Context::new(HandleId::new(), 1);

    let value = unit.execute(&ctx, request(Some("llama3.2:3b"))).await.unwrap();
    assert_eq!(value, json!("/summaries/llama3.2:3b"));
}

#[tokio::test]
async fn test_server_error_is_http_error() {
    let base = spawn_server().await;
    let unit = unit(&base, "/broken", ValueKind::Text);
    let ctx = Context::new(HandleId::new(), 0);

    let err = unit.execute(&ctx, request(None)).await.unwrap_err();
    match err {
        UnitError::Http(message) => {
            assert!(message.contains("500"));
            assert!(message.contains("model crashed"));
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_abort_while_waiting_on_server() {
    let base = spawn_server().await;
    let unit = unit(&base, "/slow", ValueKind::Path);
    let ctx = Context::new(HandleId::new(), 0);
    let token = ctx.token().clone();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let started = std::time::Instant::now();
    let err = unit.execute(&ctx, request(None)).await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_unreachable_server() {
    let unit = unit("http://127.0.0.1:9", "/audio/transcribe", ValueKind::Text);
    let ctx = Context::new(HandleId::new(), 0);
    let err = unit.execute(&ctx, request(None)).await.unwrap_err();
    assert!(matches!(err, UnitError::Http(_)));
}

use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info};

use crate::{
    error::Error,
    predict::Predictor,
    utils::{allowed_file, is_safe_upload_name, unique_filename},
};

const INDEX_HTML: &str = include_str!("../templates/index.html");

#[derive(Clone)]
pub struct AppState {
    pub predictor: Arc<Predictor>,
    pub upload_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(predictor: Predictor, upload_dir: PathBuf) -> Self {
        Self {
            predictor: Arc::new(predictor),
            upload_dir: Arc::new(upload_dir),
        }
    }
}

/// Error rendered as `{"error": message}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn payload_too_large(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Decode(e) => {
                debug!("Rejected undecodable upload: {e}");
                ApiError::bad_request("Invalid image data")
            }
            other => {
                error!("Request failed: {other}");
                ApiError::internal(other.to_string())
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClassifyResponse {
    pub image_name: String,
    pub zipped_data: Vec<(String, f64)>,
}

pub fn create_router(state: AppState, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/", get(display_form).post(classify_image))
        .route("/uploads/:filename", get(uploaded_file))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
}

async fn display_form() -> Html<&'static str> {
    Html(INDEX_HTML)
}

struct Upload {
    filename: String,
    data: Vec<u8>,
}

fn multipart_error(err: MultipartError) -> ApiError {
    debug!("Multipart read failed: {}", err.body_text());
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::payload_too_large("File too large")
    } else {
        ApiError::bad_request("Malformed multipart body")
    }
}

/// First `file` part that carries a filename. Parts without one are plain
/// form values, not files.
async fn read_file_field(multipart: &mut Multipart) -> Result<Option<Upload>, ApiError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = field.bytes().await.map_err(multipart_error)?.to_vec();
        return Ok(Some(Upload { filename, data }));
    }
    Ok(None)
}

async fn classify_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ClassifyResponse>, ApiError> {
    let mut multipart = multipart.map_err(|_| ApiError::bad_request("No file part"))?;
    let upload = read_file_field(&mut multipart)
        .await?
        .ok_or_else(|| ApiError::bad_request("No file part"))?;

    if upload.filename.is_empty() {
        return Err(ApiError::bad_request("No selected file"));
    }
    if !allowed_file(&upload.filename) {
        return Err(ApiError::bad_request("Invalid file format"));
    }

    let image_name = unique_filename(&upload.filename);
    let path = state.upload_dir.join(&image_name);
    tokio::fs::write(&path, &upload.data)
        .await
        .map_err(|e| Error::io(&path, e))?;
    info!("Stored upload {} ({} bytes)", image_name, upload.data.len());

    let predictor = state.predictor.clone();
    let prediction = tokio::task::spawn_blocking(move || predictor.classify(&upload.data))
        .await
        .map_err(|e| ApiError::internal(format!("classification task failed: {e}")))??;

    let zipped_data = prediction
        .labels
        .into_iter()
        .zip(prediction.scores.iter().map(|&s| to_probability(s)))
        .collect();

    Ok(Json(ClassifyResponse {
        image_name,
        zipped_data,
    }))
}

/// Linear probability from a log-probability, rounded to 5 decimals.
fn to_probability(log_prob: f32) -> f64 {
    let p = (log_prob as f64).exp();
    (p * 1e5).round() / 1e5
}

async fn uploaded_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    if !is_safe_upload_name(&filename) {
        return Err(ApiError::not_found("File not found"));
    }

    let path = state.upload_dir.join(&filename);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found("File not found"))
        }
        Err(e) => return Err(Error::io(&path, e).into()),
    };

    let mime = mime_guess::from_path(&filename).first_or_octet_stream();
    Ok(([(header::CONTENT_TYPE, mime.to_string())], bytes).into_response())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK" }))
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        labels::LabelStore,
        model::tests::tiny_model,
        predict::LabelMapping,
        preprocess::{tests::solid_png, CropMode, Preprocessor},
    };

    const BOUNDARY: &str = "flower-boundary";

    fn app() -> (Router, TempDir) {
        app_with_limit(5 * 1024 * 1024)
    }

    fn app_with_limit(body_limit_bytes: usize) -> (Router, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let labels = LabelStore::from_json(
            r#"{"1": "pink primrose", "2": "hard-leaved pocket orchid", "3": "canterbury bells",
                "4": "sweet pea", "5": "english marigold"}"#,
        )
        .unwrap();
        let predictor = Predictor::new(
            tiny_model(),
            labels,
            Preprocessor::new(CropMode::Center),
            LabelMapping::Offset,
            3,
        );
        let state = AppState::new(predictor, dir.path().to_path_buf());
        (create_router(state, body_limit_bytes), dir)
    }

    fn multipart_request(field: &str, filename: Option<&str>, data: &[u8]) -> Request<Body> {
        let disposition = match filename {
            Some(name) => format!("form-data; name=\"{field}\"; filename=\"{name}\""),
            None => format!("form-data; name=\"{field}\""),
        };
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(format!("Content-Disposition: {disposition}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, body.to_vec())
    }

    async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(app, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn stored_files(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[tokio::test]
    async fn classifies_an_uploaded_png() {
        let (app, dir) = app();
        let image = solid_png(300, 260, [200, 40, 120]);

        let request = multipart_request("file", Some("rose.png"), &image);
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::OK);

        let image_name = body["image_name"].as_str().unwrap();
        assert!(image_name.ends_with("_rose.png"));
        assert!(dir.path().join(image_name).exists());

        let pairs = body["zipped_data"].as_array().unwrap();
        assert_eq!(pairs.len(), 3);
        let mut total = 0.0;
        for pair in pairs {
            assert!(pair[0].is_string());
            let p = pair[1].as_f64().unwrap();
            assert!((0.0..=1.0).contains(&p));
            total += p;
        }
        assert!(total <= 1.0 + 1e-4);
    }

    #[tokio::test]
    async fn missing_file_field() {
        let (app, dir) = app();
        let (status, body) =
            send_json(&app, multipart_request("photo", Some("rose.png"), b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "No file part" }));
        assert_eq!(stored_files(&dir), 0);
    }

    #[tokio::test]
    async fn non_multipart_body_has_no_file_part() {
        let (app, _dir) = app();
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "No file part" }));
    }

    #[tokio::test]
    async fn file_part_without_filename_is_not_a_file() {
        let (app, dir) = app();
        let image = solid_png(240, 240, [9, 9, 9]);
        let (status, body) = send_json(&app, multipart_request("file", None, &image)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "No file part" }));
        assert_eq!(stored_files(&dir), 0);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_with_413() {
        let (app, dir) = app_with_limit(1024);
        let request = multipart_request("file", Some("rose.png"), &vec![7u8; 8 * 1024]);
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body, json!({ "error": "File too large" }));
        assert_eq!(stored_files(&dir), 0);
    }

    #[tokio::test]
    async fn truncated_multipart_is_a_client_error() {
        let (app, _dir) = app();
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"rose.png\"\r\n\r\nabc"
            )))
            .unwrap();
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Malformed multipart body" }));
    }

    #[tokio::test]
    async fn empty_filename() {
        let (app, _dir) = app();
        let (status, body) = send_json(&app, multipart_request("file", Some(""), b"")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "No selected file" }));
    }

    #[tokio::test]
    async fn disallowed_extension() {
        let (app, dir) = app();
        let (status, body) =
            send_json(&app, multipart_request("file", Some("rose.gif"), b"GIF89a")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Invalid file format" }));
        assert_eq!(stored_files(&dir), 0);
    }

    #[tokio::test]
    async fn undecodable_image_is_a_client_error() {
        let (app, _dir) = app();
        let request = multipart_request("file", Some("rose.jpg"), b"not a jpeg");
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Invalid image data" }));
    }

    #[tokio::test]
    async fn same_upload_twice_gets_distinct_names() {
        let (app, dir) = app();
        let image = solid_png(240, 240, [10, 200, 10]);

        let upload = || multipart_request("file", Some("rose.png"), &image);
        let (_, first) = send_json(&app, upload()).await;
        let (_, second) = send_json(&app, upload()).await;
        assert_ne!(first["image_name"], second["image_name"]);
        assert_eq!(stored_files(&dir), 2);
    }

    #[tokio::test]
    async fn uploaded_bytes_are_served_back() {
        let (app, _dir) = app();
        let image = solid_png(250, 230, [1, 2, 3]);

        let request = multipart_request("file", Some("rose.png"), &image);
        let (_, body) = send_json(&app, request).await;
        let image_name = body["image_name"].as_str().unwrap();

        let request = Request::builder()
            .uri(format!("/uploads/{image_name}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let served = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(served.to_vec(), image);
    }

    #[tokio::test]
    async fn doubled_dots_in_a_name_round_trip() {
        let (app, _dir) = app();
        let image = solid_png(240, 240, [30, 60, 90]);

        let request = multipart_request("file", Some("my..rose.png"), &image);
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        let image_name = body["image_name"].as_str().unwrap();
        assert!(image_name.ends_with("_my.rose.png"), "{image_name}");

        let request = Request::builder()
            .uri(format!("/uploads/{image_name}"))
            .body(Body::empty())
            .unwrap();
        let (status, served) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(served, image);
    }

    #[tokio::test]
    async fn traversal_filenames_are_neutralized() {
        let (app, dir) = app();
        let image = solid_png(240, 240, [5, 5, 5]);

        let (status, body) = send_json(
            &app,
            multipart_request("file", Some("../../escape.png"), &image),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let image_name = body["image_name"].as_str().unwrap();
        assert!(!image_name.contains('/'));
        assert!(dir.path().join(image_name).exists());

        let request = Request::builder()
            .uri("/uploads/..%2F..%2Fetc%2Fpasswd")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let (app, _dir) = app();
        let request = Request::builder()
            .uri("/uploads/1700000000_deadbeef_missing.png")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "File not found" }));
    }

    #[tokio::test]
    async fn form_and_health() {
        let (app, _dir) = app();

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("name=\"file\""));

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "OK" }));
    }

    #[test]
    fn probabilities_are_rounded_to_five_places() {
        assert_eq!(to_probability(0.0), 1.0);
        assert_eq!(to_probability((0.123456f32).ln()), 0.12346);
        assert_eq!(to_probability(f32::NEG_INFINITY), 0.0);
    }
}

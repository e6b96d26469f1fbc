use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use serde::Serialize;
use tint_core::Operation;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::error::ApiError;
use crate::scratch::{safe_file_name, MAX_THEME_LEN, MAX_UPLOAD_NAME_LEN};
use crate::state::AppState;

#[derive(Serialize, Debug)]
pub struct UploadResponse {
    message: &'static str,
    /// Encoded image file, standard base64.
    image: String,
    filename: String,
}

struct UploadedFile {
    file_name: String,
    bytes: Bytes,
}

struct UploadForm {
    file: Option<UploadedFile>,
    prompt: String,
    theme: String,
    option: String,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut file = None;
        let (mut prompt, mut theme, mut option) = (None, None, None);

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_owned();
            match name.as_str() {
                "file" => {
                    let file_name = field.file_name().map(str::to_owned);
                    let bytes = field.bytes().await?;
                    // browsers send a part without a filename when nothing was picked
                    if let Some(file_name) = file_name.filter(|n| !n.is_empty()) {
                        file = Some(UploadedFile { file_name, bytes });
                    }
                }
                "prompt" => prompt = Some(field.text().await?),
                "theme" => theme = Some(field.text().await?),
                "option" => option = Some(field.text().await?),
                other => debug!(field = other, "ignoring unknown form field"),
            }
        }

        Ok(Self {
            file,
            prompt: prompt.ok_or(ApiError::MissingField("prompt"))?,
            theme: theme.ok_or(ApiError::MissingField("theme"))?,
            option: option.ok_or(ApiError::MissingField("option"))?,
        })
    }
}

pub fn router(state: Arc<AppState>, cors: CorsLayer, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/upload", post(upload_image_handler))
        .route("/themes", get(list_themes_handler))
        .route("/healthz", get(healthz_handler))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upload_image_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let UploadForm {
        file,
        prompt,
        theme,
        option,
    } = UploadForm::read(multipart).await?;

    let operation: Operation = option.parse()?;
    let upload = if operation.needs_image() {
        Some(file.ok_or(ApiError::MissingInput)?)
    } else {
        None
    };
    info!(
        %operation,
        theme = %theme,
        upload = upload.as_ref().map(|f| f.file_name.as_str()),
        "upload request"
    );

    // inference blocks for seconds, keep it off the async workers
    let response = tokio::task::spawn_blocking(move || {
        process_upload(&state, operation, &prompt, &theme, upload)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("processing task failed: {e}")))??;

    Ok(Json(response))
}

/// Runs one request inside its own scratch directory, which is removed when
/// this returns regardless of outcome.
fn process_upload(
    state: &AppState,
    operation: Operation,
    prompt: &str,
    theme: &str,
    upload: Option<UploadedFile>,
) -> Result<UploadResponse, ApiError> {
    let scratch = state.scratch.session()?;
    let theme_name = safe_file_name(theme, "default", MAX_THEME_LEN);

    let (message, filename, bytes) = match upload {
        None => {
            let image = state.processor.run(None, operation, prompt, theme)?;
            let filename = format!("generated_image_{theme_name}.png");
            let bytes = scratch.persist_image(&filename, &image)?;
            ("Image generated successfully", filename, bytes)
        }
        Some(upload) => {
            let input_name = safe_file_name(&upload.file_name, "upload", MAX_UPLOAD_NAME_LEN);
            let input = scratch.write(&input_name, &upload.bytes)?;
            let image = state.processor.run(Some(&input), operation, prompt, theme)?;
            let filename = format!("processed_{theme_name}_{input_name}");
            let bytes = scratch.persist_image(&filename, &image)?;
            ("Image processed successfully", filename, bytes)
        }
    };

    info!(%filename, bytes = bytes.len(), "request complete");
    Ok(UploadResponse {
        message,
        image: BASE64_STANDARD.encode(&bytes),
        filename,
    })
}

async fn list_themes_handler(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, String>> {
    Json(
        state
            .processor
            .themes()
            .iter()
            .map(|(key, fragment)| (key.to_owned(), fragment.to_owned()))
            .collect(),
    )
}

async fn healthz_handler() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::Mutex;

    use anyhow::bail;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use image::{DynamicImage, ImageFormat};
    use serde_json::Value;
    use tint_core::{
        ImageProcessor, ImageToImage, ImageToImageRequest, Pipelines, TextToImage,
        TextToImageRequest, ThemeTable, Upscale, UpscaleRequest,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::cors::cors_layer;
    use crate::scratch::ScratchSpace;

    const BOUNDARY: &str = "tint-test-boundary";

    #[derive(Default)]
    struct FakePipeline {
        prompts: Mutex<Vec<String>>,
        fail: bool,
    }

    impl FakePipeline {
        fn output(&self, prompt: String) -> anyhow::Result<DynamicImage> {
            self.prompts.lock().unwrap().push(prompt);
            if self.fail {
                bail!("pipeline exploded");
            }
            Ok(DynamicImage::new_rgb8(16, 16))
        }
    }

    impl TextToImage for FakePipeline {
        fn generate(&self, request: TextToImageRequest) -> anyhow::Result<DynamicImage> {
            self.output(request.prompt)
        }
    }

    impl ImageToImage for FakePipeline {
        fn transform(&self, request: ImageToImageRequest) -> anyhow::Result<DynamicImage> {
            self.output(request.prompt)
        }
    }

    impl Upscale for FakePipeline {
        fn upscale(&self, request: UpscaleRequest) -> anyhow::Result<DynamicImage> {
            self.output(request.prompt)
        }
    }

    struct Harness {
        app: Router,
        pipeline: Arc<FakePipeline>,
        root: tempfile::TempDir,
        scratch_root: std::path::PathBuf,
    }

    impl Harness {
        fn new(fail: bool) -> Self {
            Self::with_cors(fail, None)
        }

        fn with_cors(fail: bool, allowed_origins: Option<&str>) -> Self {
            let pipeline = Arc::new(FakePipeline {
                fail,
                ..Default::default()
            });
            let processor = ImageProcessor::new(
                ThemeTable::default(),
                Pipelines {
                    text_to_image: pipeline.clone(),
                    image_to_image: pipeline.clone(),
                    upscale: pipeline.clone(),
                },
            );
            let root = tempfile::tempdir().unwrap();
            let scratch_root = root.path().join("temp");
            let state = Arc::new(AppState::new(processor, ScratchSpace::new(&scratch_root)));
            Self {
                app: router(state, cors_layer(allowed_origins), 1024 * 1024),
                pipeline,
                root,
                scratch_root,
            }
        }

        fn leftover_files(&self) -> usize {
            count_files(&self.scratch_root)
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
            (status, json)
        }
    }

    fn count_files(dir: &Path) -> usize {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        entries
            .map(|entry| entry.unwrap().path())
            .map(|path| if path.is_dir() { count_files(&path) } else { 1 })
            .sum()
    }

    fn png_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::new_rgb8(8, 8)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn upload_request(fields: &[(&str, &str)], file: Option<(&str, &[u8])>) -> Request<Body> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        if let Some((file_name, bytes)) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: image/png\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn decode_image(json: &Value) -> DynamicImage {
        let bytes = BASE64_STANDARD
            .decode(json["image"].as_str().unwrap())
            .unwrap();
        image::load_from_memory(&bytes).unwrap()
    }

    #[tokio::test]
    async fn generate_needs_no_file() {
        let harness = Harness::new(false);
        let request = upload_request(
            &[("prompt", "a cat"), ("theme", "anime"), ("option", "generate")],
            None,
        );

        let (status, json) = harness.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Image generated successfully");
        assert_eq!(json["filename"], "generated_image_anime.png");
        assert_eq!(decode_image(&json).width(), 16);
        assert_eq!(
            *harness.pipeline.prompts.lock().unwrap(),
            vec!["a cat, anime style, detailed, vibrant, manga-inspired".to_string()]
        );
        assert_eq!(harness.leftover_files(), 0);
    }

    #[tokio::test]
    async fn modify_without_file_is_a_bad_request() {
        let harness = Harness::new(false);
        let request = upload_request(
            &[("prompt", "a cat"), ("theme", "anime"), ("option", "modify")],
            None,
        );

        let (status, json) = harness.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["detail"], "No file uploaded");
        assert!(harness.pipeline.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn modify_returns_processed_image_and_cleans_up() {
        let harness = Harness::new(false);
        let png = png_bytes();
        let request = upload_request(
            &[("prompt", "a castle"), ("theme", "sketch"), ("option", "modify")],
            Some(("castle.png", png.as_slice())),
        );

        let (status, json) = harness.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["message"], "Image processed successfully");
        assert_eq!(json["filename"], "processed_sketch_castle.png");
        assert_eq!(decode_image(&json).height(), 16);
        assert_eq!(harness.leftover_files(), 0);
    }

    #[tokio::test]
    async fn upscale_ignores_the_prompt() {
        let harness = Harness::new(false);
        let png = png_bytes();
        let request = upload_request(
            &[("prompt", "ignored"), ("theme", "unknown"), ("option", "upscale")],
            Some(("small.png", png.as_slice())),
        );

        let (status, json) = harness.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["filename"], "processed_unknown_small.png");
        assert_eq!(
            *harness.pipeline.prompts.lock().unwrap(),
            vec!["high quality, detailed image, high quality, detailed image".to_string()]
        );
    }

    #[tokio::test]
    async fn pipeline_failure_is_a_server_error_and_leaves_no_files() {
        let harness = Harness::new(true);
        let png = png_bytes();
        let request = upload_request(
            &[("prompt", "a castle"), ("theme", "sketch"), ("option", "modify")],
            Some(("castle.png", png.as_slice())),
        );

        let (status, json) = harness.send(request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["detail"], "pipeline exploded");
        assert_eq!(harness.leftover_files(), 0);
    }

    #[tokio::test]
    async fn unsupported_operation_is_rejected() {
        let harness = Harness::new(false);
        let png = png_bytes();
        let request = upload_request(
            &[("prompt", "a cat"), ("theme", "anime"), ("option", "bogus")],
            Some(("cat.png", png.as_slice())),
        );

        let (status, json) = harness.send(request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["detail"], "Unsupported operation: bogus");
        assert_eq!(harness.leftover_files(), 0);
    }

    #[tokio::test]
    async fn missing_text_field_is_unprocessable() {
        let harness = Harness::new(false);
        let request = upload_request(&[("theme", "anime"), ("option", "generate")], None);

        let (status, json) = harness.send(request).await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["detail"], "missing form field `prompt`");
    }

    #[tokio::test]
    async fn uploaded_names_cannot_escape_the_scratch_directory() {
        let harness = Harness::new(false);
        let png = png_bytes();
        let request = upload_request(
            &[("prompt", "x"), ("theme", "../anime"), ("option", "modify")],
            Some(("../../escape.png", png.as_slice())),
        );

        let (status, json) = harness.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["filename"], "processed_anime_escape.png");
        assert!(!harness.root.path().join("escape.png").exists());
        assert_eq!(harness.leftover_files(), 0);
    }

    #[tokio::test]
    async fn lists_themes() {
        let harness = Harness::new(false);
        let request = Request::builder()
            .uri("/themes")
            .body(Body::empty())
            .unwrap();

        let (status, json) = harness.send(request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["anime"], "anime style, detailed, vibrant, manga-inspired");
        assert_eq!(json.as_object().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let harness = Harness::new(false);
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();

        let (status, _) = harness.send(request).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn long_upload_names_are_shortened_to_fit_the_output_name() {
        let harness = Harness::new(false);
        let png = png_bytes();
        let file_name = format!("{}.png", "a".repeat(240));
        let request = upload_request(
            &[("prompt", "x"), ("theme", "sketch"), ("option", "modify")],
            Some((file_name.as_str(), png.as_slice())),
        );

        let (status, json) = harness.send(request).await;

        assert_eq!(status, StatusCode::OK);
        let filename = json["filename"].as_str().unwrap();
        assert!(filename.len() <= 255);
        assert!(filename.starts_with("processed_sketch_aaaa"));
        assert!(filename.ends_with("a.png"));
        assert_eq!(harness.leftover_files(), 0);
    }

    #[tokio::test]
    async fn long_themes_are_shortened_in_the_output_name() {
        let harness = Harness::new(false);
        let theme = "t".repeat(300);
        let request = upload_request(
            &[("prompt", "x"), ("theme", theme.as_str()), ("option", "generate")],
            None,
        );

        let (status, json) = harness.send(request).await;

        assert_eq!(status, StatusCode::OK);
        let expected = format!("generated_image_{}.png", "t".repeat(MAX_THEME_LEN));
        assert_eq!(json["filename"], expected.as_str());
    }

    async fn allowed_origin(harness: &Harness, origin: &str) -> Option<String> {
        let request = Request::builder()
            .uri("/healthz")
            .header(header::ORIGIN, origin)
            .body(Body::empty())
            .unwrap();
        let response = harness.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .map(|value| value.to_str().unwrap().to_owned())
    }

    #[tokio::test]
    async fn any_origin_is_allowed_by_default() {
        let harness = Harness::new(false);
        assert_eq!(
            allowed_origin(&harness, "http://example.com").await.as_deref(),
            Some("*")
        );
    }

    #[tokio::test]
    async fn configured_origins_restrict_cors() {
        let harness = Harness::with_cors(false, Some("http://localhost:3000"));
        assert_eq!(
            allowed_origin(&harness, "http://localhost:3000").await.as_deref(),
            Some("http://localhost:3000")
        );
        assert_eq!(allowed_origin(&harness, "http://evil.example").await, None);
    }
}

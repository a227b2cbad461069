use crate::audio::{format_file_size, AudioError, AudioNormalizer};
use crate::config::Config;
use crate::engine::{InferenceError, TranscriptionEngine};
use crate::models::*;
use axum::{
    extract::{multipart::Field, rejection::JsonRejection, DefaultBodyLimit, Multipart, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// 音声ファイルを受け取るマルチパートのフィールド名
pub const AUDIO_FIELD: &str = "audio_file";

// =============================================================================
// Application State
// - 起動時に一度だけ組み立て、以降は読み取り専用で全ハンドラから共有
// - 推論エンジンは初期化に失敗した場合 None（リクエストは 503）
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Option<Arc<dyn TranscriptionEngine>>,
    pub normalizer: Arc<AudioNormalizer>,
    pub converter_available: bool,
    pub http_client: reqwest::Client,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let normalizer = AudioNormalizer::new(&config);
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.limits.url_fetch_timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("HTTPクライアントの作成に失敗: {}", e))?;

        Ok(Self {
            config: Arc::new(config),
            engine: None,
            normalizer: Arc::new(normalizer),
            converter_available: false,
            http_client,
            start_time: Instant::now(),
        })
    }

    pub fn with_engine(mut self, engine: Arc<dyn TranscriptionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_converter_available(mut self, available: bool) -> Self {
        self.converter_available = available;
        self
    }

    pub fn is_ready(&self) -> bool {
        self.engine.is_some()
    }

    fn require_engine(&self) -> ApiResult<Arc<dyn TranscriptionEngine>> {
        self.engine.clone().ok_or_else(|| {
            ApiError::new(ApiErrorCode::ModelNotLoaded, "ASR model is not initialized.")
        })
    }
}

// =============================================================================
// Router
// =============================================================================

pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);
    // マルチパートの境界分の余裕を持たせる
    let body_limit = state.config.max_file_size_bytes() + 64 * 1024;

    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/upload_and_transcribe", post(upload_and_transcribe))
        .route("/transcribe_url", post(transcribe_url))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("無効なCORSオリジンを無視します: {} ({})", origin, e);
                None
            }
        })
        .collect();

    layer.allow_origin(origins)
}

// =============================================================================
// Error Handling
// - API エラーを JSON へ変換。変換時に必ずログを残す
// =============================================================================

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    pub detail: Option<String>,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn status_code(&self) -> StatusCode {
        match self.code {
            ApiErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ApiErrorCode::UnsupportedFormat => StatusCode::BAD_REQUEST,
            ApiErrorCode::ModelNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::InferenceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorCode::InferenceFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AudioError> for ApiError {
    fn from(err: AudioError) -> Self {
        if err.is_client_error() {
            ApiError::new(
                ApiErrorCode::UnsupportedFormat,
                "Unsupported or malformed audio input.",
            )
            .with_detail(err.to_string())
        } else {
            ApiError::new(
                ApiErrorCode::InternalError,
                "Server processing error during file handling.",
            )
            .with_detail(err.to_string())
        }
    }
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Unavailable(_) => ApiError::new(
                ApiErrorCode::InferenceUnavailable,
                "Inference service is not available. Try again later.",
            )
            .with_detail(err.to_string()),
            InferenceError::RateLimited(_) => ApiError::new(
                ApiErrorCode::InferenceFailed,
                "Inference API Error: Too Many Requests (429). Try again later (rate limit).",
            )
            .with_detail(err.to_string()),
            InferenceError::Timeout(_) | InferenceError::Failed(_) => {
                ApiError::new(ApiErrorCode::InferenceFailed, "Inference API Error.")
                    .with_detail(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();

        if status_code.is_server_error() {
            log::error!(
                "{} {}: {} ({})",
                status_code.as_u16(),
                self.code.as_str(),
                self.message,
                self.detail.as_deref().unwrap_or("-")
            );
        } else {
            log::warn!(
                "{} {}: {} ({})",
                status_code.as_u16(),
                self.code.as_str(),
                self.message,
                self.detail.as_deref().unwrap_or("-")
            );
        }

        let response = ErrorResponse {
            message: self.message,
            code: self.code.as_str().to_string(),
            detail: self.detail,
        };

        (status_code, Json(response)).into_response()
    }
}

// =============================================================================
// Request Handlers
// =============================================================================

/// ヘルスチェック（`/` と `/health`）
/// - エンジン未初期化の場合は 503
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let model_loaded = state.is_ready();
    let (status_code, status) = if model_loaded {
        (StatusCode::OK, "Operational")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Error: Model failed to load")
    };

    // 読み込み済みならエンジン自身の情報、未初期化なら設定値を返す
    let (model_name, engine_kind) = match &state.engine {
        Some(engine) => (engine.model_id().to_string(), engine.kind()),
        None => (
            state.config.engine.model_id.clone(),
            state.config.engine.kind,
        ),
    };

    let response = HealthResponse {
        status: status.to_string(),
        message: "ASR API is running.".to_string(),
        model_name,
        model_loaded,
        engine: engine_kind.as_str().to_string(),
        target_sample_rate: state.normalizer.target_sample_rate(),
        converter_available: state.converter_available,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    };

    (status_code, Json(response))
}

/// マルチパートでアップロードされた音声を文字起こし
/// - `audio_file`: 音声データ本体
/// - `userId`: ログ用（任意）
pub async fn upload_and_transcribe(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<TranscribeResponse>> {
    // モデル未初期化ならアップロードを読む前に 503
    let engine = state.require_engine()?;

    let mut upload: Option<(Option<String>, Vec<u8>)> = None;
    let mut user_id: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError::new(ApiErrorCode::InvalidInput, "Failed to parse multipart data.")
            .with_detail(e.to_string())
    })? {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            AUDIO_FIELD => {
                let filename = field.file_name().map(|name| name.to_string());
                let data = read_field_bytes(field).await?;
                upload = Some((filename, data));
            }
            "userId" => {
                let text = field.text().await.map_err(|e| {
                    ApiError::new(ApiErrorCode::InvalidInput, "Failed to read userId field.")
                        .with_detail(e.to_string())
                })?;
                user_id = Some(text);
            }
            _ => {} // 未知のフィールドは無視
        }
    }

    let (filename, data) = upload.ok_or_else(|| {
        ApiError::new(
            ApiErrorCode::InvalidInput,
            format!("Missing file part named '{}'.", AUDIO_FIELD),
        )
    })?;

    if filename.as_deref() == Some("") {
        return Err(ApiError::new(ApiErrorCode::InvalidInput, "No selected file."));
    }

    log::info!(
        "ファイルを受信しました: {} ({}){}",
        filename.as_deref().unwrap_or("(no name)"),
        format_file_size(data.len() as u64),
        user_id
            .as_deref()
            .map(|id| format!(" user={}", id))
            .unwrap_or_default()
    );

    run_transcription(&state, engine, data, filename).await
}

/// URL で指定された音声を取得して文字起こし
pub async fn transcribe_url(
    State(state): State<AppState>,
    payload: Result<Json<TranscribeUrlRequest>, JsonRejection>,
) -> ApiResult<Json<TranscribeResponse>> {
    let engine = state.require_engine()?;

    let Json(request) = payload.map_err(|e| {
        ApiError::new(ApiErrorCode::InvalidInput, "Invalid JSON body.").with_detail(e.body_text())
    })?;

    let url = request.url.trim();
    if url.is_empty() {
        return Err(ApiError::new(ApiErrorCode::InvalidInput, "Missing audio URL."));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ApiError::new(
            ApiErrorCode::InvalidInput,
            "Audio URL must use http or https.",
        ));
    }

    log::info!(
        "音声URLを取得します: {}{}",
        url,
        request
            .user_id
            .as_deref()
            .map(|id| format!(" user={}", id))
            .unwrap_or_default()
    );

    let data = fetch_audio(&state, url).await?;
    let filename = url
        .split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .map(|name| name.to_string());

    run_transcription(&state, engine, data, filename).await
}

// =============================================================================
// Processing
// =============================================================================

/// 正規化 → 推論の共通ロジック
async fn run_transcription(
    state: &AppState,
    engine: Arc<dyn TranscriptionEngine>,
    data: Vec<u8>,
    filename: Option<String>,
) -> ApiResult<Json<TranscribeResponse>> {
    if data.is_empty() {
        return Err(ApiError::new(ApiErrorCode::InvalidInput, "Uploaded file is empty."));
    }
    check_file_size(&state.config, data.len())?;

    let start_time = Instant::now();

    // デコード/変換/リサンプリングは重いので `spawn_blocking`
    let normalizer = Arc::clone(&state.normalizer);
    let normalized = tokio::task::spawn_blocking(move || {
        normalizer.normalize(&data, filename.as_deref())
    })
    .await
    .map_err(|e| {
        ApiError::new(ApiErrorCode::InternalError, "Server processing error.")
            .with_detail(format!("処理スレッドエラー: {}", e))
    })??;

    log::info!(
        "文字起こしを開始します: {}ms, {}Hz (元: {}Hz/{}ch)",
        normalized.buffer.duration_ms(),
        normalized.buffer.sample_rate,
        normalized.original_sample_rate,
        normalized.original_channels
    );

    let text = engine.transcribe(&normalized.buffer).await?;
    let processing_time_ms = start_time.elapsed().as_millis() as u64;

    log::info!(
        "文字起こし完了: {}ms, {}",
        processing_time_ms,
        preview(&text, 50)
    );

    Ok(Json(TranscribeResponse {
        message: "Transcription successful".to_string(),
        transcribed_text: text,
        model_id: engine.model_id().to_string(),
        processing_time_ms,
        duration_ms: normalized.buffer.duration_ms(),
        sample_rate: normalized.buffer.sample_rate,
    }))
}

async fn read_field_bytes(field: Field<'_>) -> ApiResult<Vec<u8>> {
    field.bytes().await.map(|bytes| bytes.to_vec()).map_err(|e| {
        ApiError::new(ApiErrorCode::InvalidInput, "Failed to read uploaded file.")
            .with_detail(e.to_string())
    })
}

async fn fetch_audio(state: &AppState, url: &str) -> ApiResult<Vec<u8>> {
    let fetch_error = |detail: String| {
        ApiError::new(ApiErrorCode::InvalidInput, "Failed to fetch audio from URL.")
            .with_detail(detail)
    };

    let mut response = state
        .http_client
        .get(url)
        .send()
        .await
        .map_err(|e| fetch_error(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(fetch_error(format!("remote server returned {}", status)));
    }

    if let Some(length) = response.content_length() {
        check_file_size(&state.config, length as usize)?;
    }

    // Content-Length が無い（chunked）場合もあるので受信しながら上限を確認
    let mut data = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| fetch_error(e.to_string()))?
    {
        check_file_size(&state.config, data.len() + chunk.len())?;
        data.extend_from_slice(&chunk);
    }

    Ok(data)
}

fn check_file_size(config: &Config, size_bytes: usize) -> ApiResult<()> {
    let max_size = config.max_file_size_bytes();
    if size_bytes > max_size {
        return Err(ApiError::new(
            ApiErrorCode::InvalidInput,
            format!(
                "File is too large: {} > {}",
                format_file_size(size_bytes as u64),
                format_file_size(max_size as u64)
            ),
        ));
    }
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

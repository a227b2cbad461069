use serde::{Deserialize, Serialize};

// =============================================================================
// API Request/Response Models
// =============================================================================

/// URL 指定での文字起こしリクエスト
#[derive(Debug, Serialize, Deserialize)]
pub struct TranscribeUrlRequest {
    pub url: String,
    #[serde(default, rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscribeResponse {
    pub message: String,
    pub transcribed_text: String,
    pub model_id: String,
    pub processing_time_ms: u64,
    pub duration_ms: u64,
    pub sample_rate: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub model_name: String,
    pub model_loaded: bool,
    pub engine: String,
    pub target_sample_rate: u32,
    pub converter_available: bool,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiErrorCode {
    InvalidInput,
    UnsupportedFormat,
    ModelNotLoaded,
    InferenceUnavailable,
    InferenceFailed,
    InternalError,
}

impl ApiErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiErrorCode::InvalidInput => "INVALID_INPUT",
            ApiErrorCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ApiErrorCode::ModelNotLoaded => "MODEL_NOT_LOADED",
            ApiErrorCode::InferenceUnavailable => "INFERENCE_UNAVAILABLE",
            ApiErrorCode::InferenceFailed => "INFERENCE_FAILED",
            ApiErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

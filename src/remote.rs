use crate::audio::{encode_wav_pcm16, AudioBuffer};
use crate::config::{Config, EngineKind};
use crate::engine::{InferenceError, TranscriptionEngine};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::time::Duration;

/// ホスティングされた推論エンドポイント（Hugging Face Inference API 互換）
/// - 正規化済み音声を WAV にして POST し、`text` フィールドを取り出す
/// - リトライは行わない
pub struct RemoteInferenceEngine {
    client: reqwest::Client,
    url: String,
    api_token: SecretString,
    model_id: String,
}

impl RemoteInferenceEngine {
    pub fn new(
        url: impl Into<String>,
        api_token: SecretString,
        model_id: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("HTTPクライアントの作成に失敗: {}", e))?;

        Ok(Self {
            client,
            url: url.into(),
            api_token,
            model_id: model_id.into(),
        })
    }

    /// トークンが無い場合はエラー（サーバーは起動するが推論は 503）
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let token = config
            .engine
            .api_token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("HF_API_TOKEN が設定されていません"))?;

        Self::new(
            config.engine.inference_url.clone(),
            SecretString::from(token),
            config.engine.model_id.clone(),
            Duration::from_secs(config.engine.request_timeout_seconds),
        )
    }
}

#[async_trait]
impl TranscriptionEngine for RemoteInferenceEngine {
    async fn transcribe(&self, audio: &AudioBuffer) -> Result<String, InferenceError> {
        let body = encode_wav_pcm16(audio);

        log::debug!(
            "推論エンドポイントへ送信: {} ({} bytes)",
            self.url,
            body.len()
        );

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_token.expose_secret())
            .header("Content-Type", "audio/wav")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout(e.to_string())
                } else {
                    InferenceError::Failed(format!("request to inference endpoint failed: {}", e))
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            log::error!("推論APIエラー ({}): {}", status, error_text);

            return Err(match status.as_u16() {
                429 => InferenceError::RateLimited(error_text),
                503 => InferenceError::Unavailable(error_text),
                408 | 504 => InferenceError::Timeout(error_text),
                code => InferenceError::Failed(format!("HTTP {}: {}", code, error_text)),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| InferenceError::Failed(format!("invalid JSON from inference API: {}", e)))?;

        extract_text(&payload).ok_or_else(|| {
            InferenceError::Failed(format!("inference API response has no text: {}", payload))
        })
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Remote
    }
}

/// `[{"text": ...}]` と `{"text": ...}` の両方に対応
pub fn extract_text(payload: &Value) -> Option<String> {
    let object = match payload {
        Value::Array(items) => items.first()?,
        other => other,
    };

    object
        .get("text")
        .and_then(Value::as_str)
        .map(|text| text.trim().to_string())
}

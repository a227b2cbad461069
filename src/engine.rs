//! 音声認識の推論バックエンド
//!
//! プロセス内モデルとリモート推論エンドポイントを同じトレイトで扱う。
//! ハンドルは起動時に一度だけ作成し、以降は読み取り専用で共有する。
use crate::audio::AudioBuffer;
use crate::config::{Config, EngineKind};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[async_trait]
pub trait TranscriptionEngine: Send + Sync {
    /// 正規化済み（モノラル・ターゲットレート）の音声を文字起こしする
    async fn transcribe(&self, audio: &AudioBuffer) -> Result<String, InferenceError>;

    fn model_id(&self) -> &str;

    fn kind(&self) -> EngineKind;
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference service unavailable: {0}")]
    Unavailable(String),
    #[error("Too Many Requests (429). Try again later (rate limit): {0}")]
    RateLimited(String),
    #[error("inference request timed out: {0}")]
    Timeout(String),
    #[error("inference failed: {0}")]
    Failed(String),
}

/// 設定に従って推論エンジンを作成
pub fn build_engine(config: &Config) -> anyhow::Result<Arc<dyn TranscriptionEngine>> {
    match config.engine.kind {
        EngineKind::Remote => {
            let engine = crate::remote::RemoteInferenceEngine::from_config(config)?;
            Ok(Arc::new(engine))
        }
        EngineKind::Local => build_local_engine(config),
    }
}

#[cfg(feature = "whisper")]
fn build_local_engine(config: &Config) -> anyhow::Result<Arc<dyn TranscriptionEngine>> {
    let engine = crate::whisper::WhisperEngine::new(config)?;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "whisper"))]
fn build_local_engine(_config: &Config) -> anyhow::Result<Arc<dyn TranscriptionEngine>> {
    Err(anyhow::anyhow!(
        "Whisper engine not available (feature disabled)"
    ))
}

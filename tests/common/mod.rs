// 統合テスト共通のヘルパー
#![allow(dead_code)]

use asr_upload_api::audio::AudioBuffer;
use asr_upload_api::config::{Config, EngineKind};
use asr_upload_api::engine::{InferenceError, TranscriptionEngine};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

pub const MISSING_CONVERTER: &str = "/nonexistent/asr-test-converter";
pub const BOUNDARY: &str = "----asr-test-boundary";

/// テスト用のWAVファイルデータを生成（44バイトヘッダー + 16-bit PCM, 440Hz サイン波）
pub fn create_test_wav_data(sample_rate: u32, channels: u16, duration_seconds: f32) -> Vec<u8> {
    let frames = (sample_rate as f32 * duration_seconds) as usize;
    let block_align = channels as u32 * 2;
    let data_size = frames as u32 * block_align;

    let mut wav_data = Vec::new();
    wav_data.extend_from_slice(b"RIFF");
    wav_data.extend_from_slice(&(36 + data_size).to_le_bytes());
    wav_data.extend_from_slice(b"WAVE");
    wav_data.extend_from_slice(b"fmt ");
    wav_data.extend_from_slice(&16u32.to_le_bytes());
    wav_data.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav_data.extend_from_slice(&channels.to_le_bytes());
    wav_data.extend_from_slice(&sample_rate.to_le_bytes());
    wav_data.extend_from_slice(&(sample_rate * block_align).to_le_bytes());
    wav_data.extend_from_slice(&(block_align as u16).to_le_bytes());
    wav_data.extend_from_slice(&16u16.to_le_bytes());
    wav_data.extend_from_slice(b"data");
    wav_data.extend_from_slice(&data_size.to_le_bytes());

    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        let sample = ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 16383.0) as i16;
        for _ in 0..channels {
            wav_data.extend_from_slice(&sample.to_le_bytes());
        }
    }

    wav_data
}

/// テスト用設定（一時ディレクトリ配下、変換ツールは存在しないパス）
pub fn create_test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.paths.temp_dir = temp_dir.path().join("work").to_string_lossy().to_string();
    config.converter.binary = MISSING_CONVERTER.to_string();
    config.engine.model_id = "test/whisper-mock".to_string();
    config.limits.max_file_size_mb = 5;
    config.server.host = "127.0.0.1".to_string();
    config
}

/// 作業ディレクトリ内に残っているエントリ数
pub fn leftover_entries(config: &Config) -> usize {
    std::fs::read_dir(&config.paths.temp_dir)
        .map(|entries| entries.count())
        .unwrap_or(0)
}

pub struct MultipartPart<'a> {
    pub name: &'a str,
    pub filename: Option<&'a str>,
    pub data: &'a [u8],
}

/// multipart/form-data のボディを組み立てる
pub fn multipart_body(parts: &[MultipartPart<'_>]) -> (String, Vec<u8>) {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part.filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                    part.name, filename
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name)
                    .as_bytes(),
            ),
        }
        body.extend_from_slice(part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    (format!("multipart/form-data; boundary={}", BOUNDARY), body)
}

/// 推論エンジンのモック
pub enum MockOutcome {
    Text(&'static str),
    Unavailable,
    RateLimited,
    Failed,
}

pub struct RecordingEngine {
    outcome: MockOutcome,
    calls: AtomicUsize,
    last_audio: Mutex<Option<AudioBuffer>>,
}

impl RecordingEngine {
    pub fn new(outcome: MockOutcome) -> Self {
        Self {
            outcome,
            calls: AtomicUsize::new(0),
            last_audio: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_audio(&self) -> Option<AudioBuffer> {
        self.last_audio.lock().unwrap().clone()
    }
}

#[async_trait]
impl TranscriptionEngine for RecordingEngine {
    async fn transcribe(&self, audio: &AudioBuffer) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_audio.lock().unwrap() = Some(audio.clone());

        match self.outcome {
            MockOutcome::Text(text) => Ok(text.to_string()),
            MockOutcome::Unavailable => Err(InferenceError::Unavailable("model loading".into())),
            MockOutcome::RateLimited => Err(InferenceError::RateLimited("slow down".into())),
            MockOutcome::Failed => Err(InferenceError::Failed("model exploded".into())),
        }
    }

    fn model_id(&self) -> &str {
        "test/whisper-mock"
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Local
    }
}

/// ローカルにテスト用サーバーを起動してアドレスを返す
pub async fn spawn_server(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

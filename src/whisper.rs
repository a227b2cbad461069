use crate::audio::AudioBuffer;
use crate::config::{Config, EngineKind};
use crate::engine::{InferenceError, TranscriptionEngine};
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// whisper.cpp が受け付けるサンプリングレート
pub const WHISPER_SAMPLE_RATE: u32 = 16000;

/// プロセス内 Whisper エンジン
/// - `WhisperContext` は起動時に一度だけ読み込み、`Arc` で共有
/// - 推論ごとに独立した `state` を作るので同時リクエストでもロック不要
pub struct WhisperEngine {
    context: Arc<WhisperContext>,
    model_id: String,
    language: Option<String>,
    threads: i32,
}

impl WhisperEngine {
    /// モデルファイルの存在確認 → WhisperContext 初期化
    /// - GPU 初期化に失敗した場合は CPU で再試行
    pub fn new(config: &Config) -> Result<Self> {
        let model_path = config.engine.model_path.as_str();
        if !Path::new(model_path).exists() {
            return Err(anyhow::anyhow!(
                "Whisperモデルファイルが見つかりません: {}",
                model_path
            ));
        }

        if config.audio.target_sample_rate != WHISPER_SAMPLE_RATE {
            log::warn!(
                "ターゲットレート {}Hz は Whisper の想定 ({}Hz) と異なります",
                config.audio.target_sample_rate,
                WHISPER_SAMPLE_RATE
            );
        }

        let mut ctx_params = WhisperContextParameters::default();
        ctx_params.use_gpu = config.engine.enable_gpu;

        let context = match WhisperContext::new_with_params(model_path, ctx_params) {
            Ok(ctx) => ctx,
            Err(e) if config.engine.enable_gpu => {
                log::warn!("GPU初期化に失敗しました。CPUで再試行します: {}", e);
                let mut cpu_params = WhisperContextParameters::default();
                cpu_params.use_gpu = false;
                WhisperContext::new_with_params(model_path, cpu_params)
                    .map_err(|e| anyhow::anyhow!("Whisperコンテキストの初期化に失敗: {}", e))?
            }
            Err(e) => {
                return Err(anyhow::anyhow!("Whisperコンテキストの初期化に失敗: {}", e));
            }
        };

        let language = match config.engine.language.trim() {
            "" => None,
            lang if lang.eq_ignore_ascii_case("auto") => None,
            lang => Some(lang.to_string()),
        };

        log::info!(
            "Whisperモデルを読み込みました: {} ({})",
            config.engine.model_id,
            model_path
        );

        Ok(Self {
            context: Arc::new(context),
            model_id: config.engine.model_id.clone(),
            language,
            threads: config.engine.threads.max(1) as i32,
        })
    }
}

#[async_trait]
impl TranscriptionEngine for WhisperEngine {
    async fn transcribe(&self, audio: &AudioBuffer) -> Result<String, InferenceError> {
        if audio.is_empty() {
            return Err(InferenceError::Failed("音声データが空です".to_string()));
        }
        if audio.sample_rate != WHISPER_SAMPLE_RATE {
            return Err(InferenceError::Failed(format!(
                "Whisper requires {}Hz input, got {}Hz",
                WHISPER_SAMPLE_RATE, audio.sample_rate
            )));
        }

        let context = Arc::clone(&self.context);
        let language = self.language.clone();
        let threads = self.threads;
        let samples = audio.samples.clone();

        // 推論は CPU 集約的なのでブロッキングスレッドで実行
        tokio::task::spawn_blocking(move || {
            run_inference(&context, language.as_deref(), threads, &samples)
        })
        .await
        .map_err(|e| InferenceError::Failed(format!("推論スレッドエラー: {}", e)))?
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Local
    }
}

fn run_inference(
    context: &WhisperContext,
    language: Option<&str>,
    threads: i32,
    samples: &[f32],
) -> Result<String, InferenceError> {
    let start_time = std::time::Instant::now();

    let mut state = context
        .create_state()
        .map_err(|e| InferenceError::Failed(format!("Whisper状態の作成に失敗: {}", e)))?;

    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    if let Some(language) = language {
        params.set_language(Some(language));
    }
    params.set_n_threads(threads);
    params.set_translate(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);

    state
        .full(params, samples)
        .map_err(|e| InferenceError::Failed(format!("文字起こしに失敗: {}", e)))?;

    let segment_count = state
        .full_n_segments()
        .map_err(|e| InferenceError::Failed(format!("セグメント数の取得に失敗: {}", e)))?;

    let mut text = String::new();
    for i in 0..segment_count {
        let segment = state.full_get_segment_text(i).map_err(|e| {
            InferenceError::Failed(format!("セグメント{}のテキスト取得に失敗: {}", i, e))
        })?;
        text.push_str(segment.trim());
        text.push(' ');
    }

    log::info!(
        "文字起こし完了: {}ms, {}セグメント",
        start_time.elapsed().as_millis(),
        segment_count
    );

    let text = text.trim().to_string();
    if text.is_empty() {
        Ok("(no speech recognized)".to_string())
    } else {
        Ok(text)
    }
}

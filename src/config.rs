use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 設定ファイルのパスを指す環境変数名
pub const CONFIG_PATH_ENV: &str = "ASR_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub audio: AudioConfig,
    pub converter: ConverterConfig,
    pub paths: PathsConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

/// 推論バックエンドの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// プロセス内で whisper モデルを読み込む
    Local,
    /// ホスティングされた推論エンドポイントへ転送する
    Remote,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Local => "local",
            EngineKind::Remote => "remote",
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(EngineKind::Local),
            "remote" => Ok(EngineKind::Remote),
            other => Err(anyhow::anyhow!("unknown engine kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// レスポンスとヘルスチェックに載せるモデル識別子
    pub model_id: String,
    pub model_path: String,
    pub language: String,
    pub enable_gpu: bool,
    pub threads: usize,
    pub inference_url: String,
    pub request_timeout_seconds: u64,
    /// ベアラートークン。設定ファイルには書き出さない
    #[serde(skip)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub target_sample_rate: u32,
    pub resample_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    pub binary: String,
    /// true の場合、起動時に変換ツールが見つからなければ起動を中止する
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub temp_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_file_size_mb: usize,
    /// デコード後の音声長の上限（圧縮形式は小さなファイルでも長時間になりうる）
    pub max_audio_duration_minutes: u32,
    pub url_fetch_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
                cors_origins: vec!["*".to_string()],
            },
            engine: EngineConfig {
                kind: EngineKind::Local,
                model_id: "p29ris/whisper-small-torgo-step2500".to_string(),
                model_path: "models/ggml-small.bin".to_string(),
                language: "en".to_string(),
                enable_gpu: false,
                threads: 4,
                inference_url:
                    "https://api-inference.huggingface.co/models/p29ris/whisper-tiny-step1300"
                        .to_string(),
                request_timeout_seconds: 120,
                api_token: None,
            },
            audio: AudioConfig {
                target_sample_rate: 16000,
                resample_chunk_size: 1024,
            },
            converter: ConverterConfig {
                binary: "ffmpeg".to_string(),
                required: false,
            },
            paths: PathsConfig {
                temp_dir: "temp".to_string(),
            },
            limits: LimitsConfig {
                max_file_size_mb: 25,
                max_audio_duration_minutes: 30,
                url_fetch_timeout_seconds: 30,
            },
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn load_or_create_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            match Self::load_from_file(&path) {
                Ok(config) => Ok(config),
                Err(e) => {
                    log::warn!(
                        "設定ファイルの読み込みに失敗しました: {}. デフォルト設定を使用します。",
                        e
                    );
                    Ok(Self::default())
                }
            }
        } else {
            let config = Self::default();
            config.save_to_file(&path)?;
            log::info!(
                "デフォルト設定ファイルを作成しました: {}",
                path.as_ref().display()
            );
            Ok(config)
        }
    }

    /// 環境変数による上書き（起動時に一度だけ適用）
    /// - `lookup` を差し替えられるようにしてテストでプロセス環境を汚さない
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(port) = get("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("PORT が不正です: {} ({})", port, e))?;
        }
        if let Some(model_id) = get("HF_MODEL_NAME") {
            self.engine.model_id = model_id;
        }
        if let Some(kind) = get("ASR_ENGINE") {
            self.engine.kind = kind.parse()?;
        }
        if let Some(model_path) = get("ASR_MODEL_PATH") {
            self.engine.model_path = model_path;
        }
        if let Some(url) = get("HF_INFERENCE_URL") {
            self.engine.inference_url = url;
        }
        if let Some(token) = get("HF_API_TOKEN") {
            self.engine.api_token = Some(token);
        }
        if let Some(rate) = get("ASR_TARGET_SAMPLE_RATE") {
            self.audio.target_sample_rate = rate.trim().parse().map_err(|e| {
                anyhow::anyhow!("ASR_TARGET_SAMPLE_RATE が不正です: {} ({})", rate, e)
            })?;
        }
        if let Some(binary) = get("ASR_CONVERTER_BIN") {
            self.converter.binary = binary;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("無効なポート番号: {}", self.server.port));
        }

        if self.audio.target_sample_rate == 0 {
            return Err(anyhow::anyhow!("ターゲットサンプリングレートは1Hz以上である必要があります"));
        }

        if self.audio.resample_chunk_size == 0 {
            return Err(anyhow::anyhow!("リサンプルのチャンクサイズは1以上である必要があります"));
        }

        if self.limits.max_file_size_mb == 0 {
            return Err(anyhow::anyhow!("最大ファイルサイズは1MB以上である必要があります"));
        }

        if self.limits.max_audio_duration_minutes == 0 {
            return Err(anyhow::anyhow!("最大音声長は1分以上である必要があります"));
        }

        if self.engine.model_id.trim().is_empty() {
            return Err(anyhow::anyhow!("モデル識別子が設定されていません"));
        }

        if self.engine.kind == EngineKind::Remote && self.engine.inference_url.trim().is_empty() {
            return Err(anyhow::anyhow!("推論エンドポイントの URL が設定されていません"));
        }

        if self.converter.binary.trim().is_empty() {
            return Err(anyhow::anyhow!("変換ツールのパスが設定されていません"));
        }

        // 一時ディレクトリの作成
        let temp_dir = Path::new(&self.paths.temp_dir);
        if !temp_dir.exists() {
            fs::create_dir_all(temp_dir).map_err(|e| {
                anyhow::anyhow!("ディレクトリの作成に失敗: {} - {}", self.paths.temp_dir, e)
            })?;
        }

        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn max_file_size_bytes(&self) -> usize {
        self.limits.max_file_size_mb * 1024 * 1024
    }

    pub fn max_audio_duration_seconds(&self) -> u64 {
        self.limits.max_audio_duration_minutes as u64 * 60
    }
}

use crate::config::Config;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

// =============================================================================
// Data Types
// =============================================================================

/// モノラル f32 サンプル列とそのサンプリングレート
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as f64 / self.sample_rate as f64 * 1000.0) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// 正規化済み音声と、パイプラインが何をしたかの記録
#[derive(Debug, Clone)]
pub struct NormalizedAudio {
    pub buffer: AudioBuffer,
    pub original_sample_rate: u32,
    pub original_channels: u16,
    /// 外部変換ツールを経由したか
    pub converted: bool,
    /// リサンプリングを実行したか（同一レートなら false）
    pub resampled: bool,
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio decoding failed: {reason}")]
    DecodeFailed { reason: String },
    #[error("format converter '{binary}' is unavailable: {reason}")]
    ConversionUnavailable { binary: String, reason: String },
    #[error("format conversion failed: {reason}")]
    ConversionFailed { reason: String },
    #[error("audio is too long: exceeds the limit of {max_seconds} seconds")]
    DurationExceeded { max_seconds: u64 },
    #[error("resampling failed: {reason}")]
    ResampleFailed { reason: String },
    #[error("temporary file handling failed: {0}")]
    Io(#[from] std::io::Error),
}

impl AudioError {
    /// クライアント起因（不正・未対応の入力）かどうか
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AudioError::DecodeFailed { .. }
                | AudioError::ConversionUnavailable { .. }
                | AudioError::ConversionFailed { .. }
                | AudioError::DurationExceeded { .. }
        )
    }

    fn decode(reason: impl Into<String>) -> Self {
        AudioError::DecodeFailed {
            reason: reason.into(),
        }
    }
}

/// デコード直後（ダウンミックス済み、リサンプル前）の音声
struct DecodedAudio {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

// =============================================================================
// Normalizer
// =============================================================================

/// 音声取り込み・正規化パイプライン
/// - 直接デコード → 失敗時は外部変換ツール → モノラル化 → ターゲットレートへリサンプル
/// - 状態を持たないので複数リクエストから共有できる
#[derive(Debug, Clone)]
pub struct AudioNormalizer {
    target_sample_rate: u32,
    chunk_size: usize,
    max_duration_seconds: u64,
    converter: Converter,
    temp_root: PathBuf,
}

impl AudioNormalizer {
    pub fn new(config: &Config) -> Self {
        Self {
            target_sample_rate: config.audio.target_sample_rate,
            chunk_size: config.audio.resample_chunk_size.max(1),
            max_duration_seconds: config.max_audio_duration_seconds(),
            converter: Converter::new(&config.converter.binary),
            temp_root: PathBuf::from(&config.paths.temp_dir),
        }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    /// バイト列をモノラル・ターゲットレートの音声に変換
    pub fn normalize(
        &self,
        bytes: &[u8],
        filename: Option<&str>,
    ) -> Result<NormalizedAudio, AudioError> {
        let format_hint = detect_audio_format(bytes, filename);

        let (decoded, converted) =
            match decode_bytes(bytes, format_hint, self.max_duration_seconds) {
                Ok(decoded) => (decoded, false),
                // 長さ超過は変換ツールへフォールバックしない
                Err(err @ AudioError::DurationExceeded { .. }) => return Err(err),
                Err(direct_err) => {
                    log::info!(
                        "直接デコードに失敗しました。変換ツールで再試行します: {}",
                        direct_err
                    );
                    (self.decode_via_converter(bytes, format_hint)?, true)
                }
            };

        let original_sample_rate = decoded.sample_rate;
        let original_channels = decoded.channels;

        let (samples, resampled) = if original_sample_rate == self.target_sample_rate {
            (decoded.samples, false)
        } else {
            let samples = resample(
                &decoded.samples,
                original_sample_rate,
                self.target_sample_rate,
                self.chunk_size,
            )?;
            (samples, true)
        };

        let buffer = AudioBuffer::mono(samples, self.target_sample_rate);

        log::debug!(
            "音声を正規化しました: {}Hz/{}ch -> {}Hz/1ch, {}ms (変換: {}, リサンプル: {})",
            original_sample_rate,
            original_channels,
            buffer.sample_rate,
            buffer.duration_ms(),
            converted,
            resampled
        );

        Ok(NormalizedAudio {
            buffer,
            original_sample_rate,
            original_channels,
            converted,
            resampled,
        })
    }

    /// 一時ディレクトリに書き出して変換ツールで WAV にし、再デコード
    /// - `TempDir` のドロップで成功・失敗どちらの経路でも削除される
    fn decode_via_converter(
        &self,
        bytes: &[u8],
        format_hint: Option<&str>,
    ) -> Result<DecodedAudio, AudioError> {
        fs::create_dir_all(&self.temp_root)?;
        let workdir = tempfile::Builder::new()
            .prefix("asr-convert-")
            .tempdir_in(&self.temp_root)?;

        let input_path = workdir
            .path()
            .join(format!("input.{}", format_hint.unwrap_or("bin")));
        let output_path = workdir.path().join("converted.wav");
        fs::write(&input_path, bytes)?;

        self.converter.convert(&input_path, &output_path)?;

        let converted = fs::read(&output_path).map_err(|e| AudioError::ConversionFailed {
            reason: format!("converter produced no output: {}", e),
        })?;

        decode_bytes(&converted, Some("wav"), self.max_duration_seconds).map_err(|e| match e {
            AudioError::DurationExceeded { .. } => e,
            e => AudioError::ConversionFailed {
                reason: format!("converted audio could not be decoded: {}", e),
            },
        })
    }
}

// =============================================================================
// External Converter
// =============================================================================

/// 外部フォーマット変換ツール（既定は ffmpeg）
#[derive(Debug, Clone)]
pub struct Converter {
    binary: String,
}

impl Converter {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// `<binary> -version` が起動できるかを確認
    pub fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    /// 入力を 16-bit PCM の WAV に変換
    pub fn convert(&self, input: &Path, output: &Path) -> Result<(), AudioError> {
        let result = Command::new(&self.binary)
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(input)
            .args(["-vn", "-acodec", "pcm_s16le", "-f", "wav"])
            .arg(output)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| AudioError::ConversionUnavailable {
                binary: self.binary.clone(),
                reason: e.to_string(),
            })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let stderr = stderr.trim();
            return Err(AudioError::ConversionFailed {
                reason: format!(
                    "{} exited with {}: {}",
                    self.binary,
                    result.status,
                    truncate(stderr, 512)
                ),
            });
        }

        Ok(())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

// =============================================================================
// Decode / Resample
// =============================================================================

/// symphonia でデコードし、フレームごとにチャンネル平均を取ってモノラル化
/// - `max_duration_seconds` を超えた時点で打ち切る
fn decode_bytes(
    bytes: &[u8],
    format_hint: Option<&str>,
    max_duration_seconds: u64,
) -> Result<DecodedAudio, AudioError> {
    if bytes.is_empty() {
        return Err(AudioError::decode("empty input"));
    }

    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = format_hint {
        hint.with_extension(extension);
    }

    let meta_opts: MetadataOptions = Default::default();
    let fmt_opts: FormatOptions = Default::default();

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &fmt_opts, &meta_opts)
        .map_err(|e| AudioError::decode(format!("probe: {}", e)))?;
    let mut format = probed.format;

    let (track_id, codec_params) = {
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioError::decode("no audio track found"))?;
        (track.id, track.codec_params.clone())
    };

    let dec_opts: DecoderOptions = Default::default();
    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &dec_opts)
        .map_err(|e| AudioError::decode(format!("codec: {}", e)))?;

    let mut samples = Vec::new();
    let mut sample_rate = codec_params.sample_rate;
    let mut channels = codec_params.channels.map(|ch| ch.count() as u16);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::ResetRequired) => break,
            Err(SymphoniaError::IoError(ref err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(err) => return Err(AudioError::decode(format!("packet: {}", err))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(err)) => {
                log::warn!("破損したフレームをスキップします: {}", err);
                continue;
            }
            Err(SymphoniaError::IoError(ref err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(err) => return Err(AudioError::decode(format!("decode: {}", err))),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            continue;
        }

        let channel_count = spec.channels.count().max(1);
        if sample_rate.is_none() {
            sample_rate = Some(spec.rate);
        }
        if channels.is_none() {
            channels = Some(channel_count as u16);
        }

        let mut sample_buf = SampleBuffer::<f32>::new(frames as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        if channel_count == 1 {
            samples.extend_from_slice(sample_buf.samples());
        } else {
            samples.extend(
                sample_buf
                    .samples()
                    .chunks(channel_count)
                    .map(|frame| frame.iter().sum::<f32>() / channel_count as f32),
            );
        }

        let rate = sample_rate.unwrap_or(spec.rate).max(1) as u64;
        if samples.len() as u64 > rate * max_duration_seconds {
            return Err(AudioError::DurationExceeded {
                max_seconds: max_duration_seconds,
            });
        }
    }

    if samples.is_empty() {
        return Err(AudioError::decode("no audio samples decoded"));
    }

    let sample_rate = sample_rate
        .filter(|rate| *rate > 0)
        .ok_or_else(|| AudioError::decode("unknown sample rate"))?;

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels: channels.unwrap_or(1),
    })
}

/// sinc 補間でサンプリングレートを変換
/// - 固定長チャンクで処理し、末尾はゼロ詰め
/// - フィルタの遅延分を捨て、末尾は無音チャンクで押し出す
/// - 出力長は `round(len * ratio)` に揃える
fn resample(
    samples: &[f32],
    from_rate: u32,
    to_rate: u32,
    chunk_size: usize,
) -> Result<Vec<f32>, AudioError> {
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1).map_err(|e| {
        AudioError::ResampleFailed {
            reason: format!("resampler init: {}", e),
        }
    })?;

    let delay = resampler.output_delay();
    let expected_len = (samples.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(delay + expected_len + chunk_size);

    let mut process_chunk = |input: Vec<f32>, output: &mut Vec<f32>| -> Result<(), AudioError> {
        let result = resampler
            .process(&[input], None)
            .map_err(|e| AudioError::ResampleFailed {
                reason: e.to_string(),
            })?;
        if let Some(channel) = result.first() {
            output.extend_from_slice(channel);
        }
        Ok(())
    };

    for chunk in samples.chunks(chunk_size) {
        let mut input = chunk.to_vec();
        input.resize(chunk_size, 0.0);
        process_chunk(input, &mut output)?;
    }

    // 遅延に相当する末尾がまだ内部バッファに残っている
    while output.len() < delay + expected_len {
        process_chunk(vec![0.0; chunk_size], &mut output)?;
    }

    output.drain(..delay);
    output.truncate(expected_len);
    Ok(output)
}

// =============================================================================
// Utility Functions
// =============================================================================

/// 16-bit PCM の WAV バイト列を作成
pub fn encode_wav_pcm16(buffer: &AudioBuffer) -> Vec<u8> {
    let channels = buffer.channels.max(1);
    let block_align = channels * 2;
    let data_size = (buffer.samples.len() * 2) as u32;

    let mut wav = Vec::with_capacity(44 + data_size as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_size).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&buffer.sample_rate.to_le_bytes());
    wav.extend_from_slice(&(buffer.sample_rate * block_align as u32).to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_size.to_le_bytes());

    for &sample in &buffer.samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        wav.extend_from_slice(&value.to_le_bytes());
    }

    wav
}

/// 音声ファイルの形式を推定（拡張子 → 先頭バイト）
pub fn detect_audio_format(bytes: &[u8], filename: Option<&str>) -> Option<&'static str> {
    let by_extension = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .and_then(|ext| match ext.to_ascii_lowercase().as_str() {
            "wav" | "wave" => Some("wav"),
            "mp3" => Some("mp3"),
            "m4a" | "mp4" | "aac" => Some("m4a"),
            "flac" => Some("flac"),
            "ogg" | "oga" | "opus" => Some("ogg"),
            "webm" => Some("webm"),
            _ => None,
        });

    by_extension.or_else(|| sniff_magic(bytes))
}

fn sniff_magic(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        Some("wav")
    } else if bytes.len() >= 3 && &bytes[0..3] == b"ID3" {
        Some("mp3")
    } else if bytes.len() >= 2 && bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0 {
        Some("mp3")
    } else if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
        Some("m4a")
    } else if bytes.len() >= 4 && &bytes[0..4] == b"fLaC" {
        Some("flac")
    } else if bytes.len() >= 4 && &bytes[0..4] == b"OggS" {
        Some("ogg")
    } else if bytes.len() >= 4 && bytes[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        Some("webm")
    } else {
        None
    }
}

/// ファイルサイズを人間が読みやすい形式で表示
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size as u64, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

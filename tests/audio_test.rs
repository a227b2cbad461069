mod common;

use asr_upload_api::audio::*;
use common::*;
use tempfile::TempDir;

#[cfg(test)]
mod audio_tests {
    use super::*;

    /// 16kHz モノラルはリサンプルせずそのまま通す
    #[test]
    fn test_target_rate_mono_wav_is_passed_through() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let normalizer = AudioNormalizer::new(&config);

        let wav = create_test_wav_data(16000, 1, 1.0);
        let normalized = normalizer.normalize(&wav, Some("speech.wav")).unwrap();

        assert!(!normalized.resampled);
        assert!(!normalized.converted);
        assert_eq!(normalized.original_sample_rate, 16000);
        assert_eq!(normalized.buffer.sample_rate, 16000);
        assert_eq!(normalized.buffer.channels, 1);
        assert_eq!(normalized.buffer.samples.len(), 16000);
        assert_eq!(normalized.buffer.duration_ms(), 1000);
    }

    /// 44.1kHz ステレオ → 16kHz モノラル
    #[test]
    fn test_stereo_44k_wav_is_downmixed_and_resampled() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let normalizer = AudioNormalizer::new(&config);

        let wav = create_test_wav_data(44100, 2, 1.0);
        let normalized = normalizer.normalize(&wav, Some("speech.wav")).unwrap();

        assert!(normalized.resampled);
        assert!(!normalized.converted);
        assert_eq!(normalized.original_sample_rate, 44100);
        assert_eq!(normalized.original_channels, 2);
        assert_eq!(normalized.buffer.sample_rate, 16000);
        assert_eq!(normalized.buffer.channels, 1);
        assert_eq!(normalized.buffer.samples.len(), 16000);

        // 振幅はおおよそ保たれる（0.5 付近のサイン波）
        let peak = normalized
            .buffer
            .samples
            .iter()
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(peak > 0.3 && peak < 0.7, "peak = {}", peak);
    }

    /// 拡張子が無くてもマジックナンバーでデコードできる
    #[test]
    fn test_wav_without_filename_is_decoded() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.audio.target_sample_rate = 8000;
        let normalizer = AudioNormalizer::new(&config);

        let wav = create_test_wav_data(16000, 1, 0.5);
        let normalized = normalizer.normalize(&wav, None).unwrap();

        assert!(normalized.resampled);
        assert_eq!(normalized.buffer.sample_rate, 8000);
        assert_eq!(normalized.buffer.samples.len(), 4000);
    }

    /// 変換ツールが無い場合は ConversionUnavailable、一時ファイルは残らない
    #[test]
    fn test_undecodable_input_without_converter() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let normalizer = AudioNormalizer::new(&config);

        let result = normalizer.normalize(b"definitely not audio data", Some("clip.xyz"));

        match result {
            Err(err @ AudioError::ConversionUnavailable { .. }) => {
                assert!(err.is_client_error());
                assert!(err.to_string().contains(MISSING_CONVERTER));
            }
            other => panic!("unexpected result: {:?}", other.map(|n| n.buffer.sample_rate)),
        }
        assert_eq!(leftover_entries(&config), 0);
    }

    /// 変換ツールが異常終了した場合は ConversionFailed
    #[cfg(unix)]
    #[test]
    fn test_converter_nonzero_exit_is_conversion_failed() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.converter.binary = "false".to_string();
        let normalizer = AudioNormalizer::new(&config);

        let result = normalizer.normalize(b"garbage bytes", Some("clip.webm"));

        assert!(matches!(result, Err(AudioError::ConversionFailed { .. })));
        assert_eq!(leftover_entries(&config), 0);
    }

    /// 変換ツールが成功しても出力が無ければ ConversionFailed
    #[cfg(unix)]
    #[test]
    fn test_converter_without_output_is_conversion_failed() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.converter.binary = "true".to_string();
        let normalizer = AudioNormalizer::new(&config);

        let result = normalizer.normalize(b"garbage bytes", None);

        match result {
            Err(AudioError::ConversionFailed { reason }) => {
                assert!(reason.contains("no output"), "reason = {}", reason);
            }
            other => panic!("unexpected result: {:?}", other.map(|n| n.buffer.sample_rate)),
        }
        assert_eq!(leftover_entries(&config), 0);
    }

    /// 直接デコードできない入力を変換ツール経由で 16kHz モノラルにする
    #[cfg(unix)]
    #[test]
    fn test_converter_output_is_decoded_and_resampled() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);

        // 最後の引数（出力パス）へ用意済みの 44.1kHz ステレオ WAV をコピーするだけの変換ツール
        let source_wav = temp_dir.path().join("converted-source.wav");
        std::fs::write(&source_wav, create_test_wav_data(44100, 2, 0.5)).unwrap();
        let script = temp_dir.path().join("fake-ffmpeg.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n[ \"$1\" = \"-version\" ] && exit 0\nfor last in \"$@\"; do :; done\ncp \"{}\" \"$last\"\n",
                source_wav.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        config.converter.binary = script.to_string_lossy().to_string();

        let normalizer = AudioNormalizer::new(&config);

        // 書き込み直後の実行は並行テストの fork と重なると ETXTBSY になりうる
        let mut result = normalizer.normalize(b"opaque container bytes", Some("clip.webm"));
        for _ in 0..5 {
            if !matches!(result, Err(AudioError::ConversionUnavailable { .. })) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
            result = normalizer.normalize(b"opaque container bytes", Some("clip.webm"));
        }
        let normalized = result.unwrap();

        assert!(normalized.converted);
        assert!(normalized.resampled);
        assert_eq!(normalized.original_sample_rate, 44100);
        assert_eq!(normalized.original_channels, 2);
        assert_eq!(normalized.buffer.sample_rate, 16000);
        assert_eq!(normalized.buffer.channels, 1);
        assert_eq!(normalized.buffer.samples.len(), 8000);
        assert_eq!(leftover_entries(&config), 0);
    }

    /// 上限を超える長さの音声はデコード途中で打ち切り、変換ツールも使わない
    #[test]
    fn test_audio_longer_than_limit_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.limits.max_audio_duration_minutes = 1;
        let normalizer = AudioNormalizer::new(&config);

        let wav = create_test_wav_data(8000, 1, 61.0);
        let err = normalizer.normalize(&wav, Some("long.wav")).unwrap_err();

        match err {
            AudioError::DurationExceeded { max_seconds } => assert_eq!(max_seconds, 60),
            other => panic!("unexpected error: {}", other),
        }
        assert!(AudioError::DurationExceeded { max_seconds: 60 }.is_client_error());
        assert_eq!(leftover_entries(&config), 0);

        // 上限以内ならそのまま通る
        let wav = create_test_wav_data(8000, 1, 2.0);
        assert!(normalizer.normalize(&wav, Some("short.wav")).is_ok());
    }

    #[test]
    fn test_empty_input_without_converter_is_client_error() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let normalizer = AudioNormalizer::new(&config);

        let err = normalizer.normalize(&[], None).unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn test_converter_availability() {
        assert!(!Converter::new(MISSING_CONVERTER).is_available());
    }

    /// WAV エンコード結果は再デコードでき、レートと長さが保たれる
    #[test]
    fn test_encode_wav_pcm16_is_decodable() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let normalizer = AudioNormalizer::new(&config);

        let samples: Vec<f32> = (0..1600).map(|i| ((i % 100) as f32 / 100.0) - 0.5).collect();
        let buffer = AudioBuffer::mono(samples, 16000);
        let wav = encode_wav_pcm16(&buffer);

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 1600 * 2);

        let normalized = normalizer.normalize(&wav, Some("roundtrip.wav")).unwrap();
        assert_eq!(normalized.buffer.samples.len(), 1600);
        assert!(!normalized.resampled);
    }

    #[test]
    fn test_detect_audio_format() {
        assert_eq!(detect_audio_format(b"", Some("voice.MP3")), Some("mp3"));
        assert_eq!(detect_audio_format(b"", Some("voice.m4a")), Some("m4a"));
        assert_eq!(detect_audio_format(b"", Some("voice.opus")), Some("ogg"));
        assert_eq!(
            detect_audio_format(&create_test_wav_data(16000, 1, 0.01), Some("upload")),
            Some("wav")
        );
        assert_eq!(detect_audio_format(b"fLaC\x00\x00\x00\x22", None), Some("flac"));
        assert_eq!(detect_audio_format(b"random", None), None);
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(500), "500 B");
        assert_eq!(format_file_size(1024), "1.0 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1024 * 1024), "1.0 MB");
        assert_eq!(format_file_size(1536 * 1024 * 1024), "1.5 GB");
    }

    #[test]
    fn test_audio_buffer_duration() {
        let buffer = AudioBuffer::mono(vec![0.0; 8000], 16000);
        assert_eq!(buffer.duration_ms(), 500);
        assert!(!buffer.is_empty());
        assert_eq!(AudioBuffer::mono(Vec::new(), 0).duration_ms(), 0);
    }
}

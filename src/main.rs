use asr_upload_api::config::{Config, CONFIG_PATH_ENV};
use asr_upload_api::engine::build_engine;
use asr_upload_api::handlers::{self, AppState};
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ログの初期化（RUST_LOG 未設定時は info）
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("asr_upload_api を起動中...");

    // 設定ファイルの読み込み → 環境変数で上書き → 検証
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.toml".to_string());
    let mut config = Config::load_or_create_default(&config_path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;

    log::info!("サーバーアドレス: {}", config.server_address());
    log::info!(
        "推論エンジン: {} (モデル: {})",
        config.engine.kind.as_str(),
        config.engine.model_id
    );

    let mut app_state = AppState::new(config.clone())?;

    // 変換ツールの確認
    // - required=true なら起動を中止、それ以外はフォールバック無しで続行
    let converter = app_state.normalizer.converter();
    let converter_available = converter.is_available();
    if converter_available {
        log::info!("変換ツールを検出しました: {}", converter.binary());
    } else if config.converter.required {
        return Err(anyhow::anyhow!(
            "変換ツールが見つかりません: {}",
            converter.binary()
        ));
    } else {
        log::warn!(
            "変換ツールが見つかりません: {}. 直接デコードできない形式は 400 になります",
            converter.binary()
        );
    }
    app_state = app_state.with_converter_available(converter_available);

    // 推論エンジンの初期化（失敗してもサーバーは起動し、文字起こしは 503）
    match build_engine(&config) {
        Ok(engine) => {
            log::info!("推論エンジンを初期化しました: {}", engine.model_id());
            app_state = app_state.with_engine(engine);
        }
        Err(e) => {
            log::error!("推論エンジンの初期化に失敗しました: {}", e);
            log::error!("サーバーは起動しますが、文字起こし機能は利用できません");
        }
    }

    let app = handlers::router(app_state);

    let addr: SocketAddr = config
        .server_address()
        .parse()
        .map_err(|e| anyhow::anyhow!("無効なサーバーアドレス: {}", e))?;

    log::info!("サーバーを起動します: http://{}", addr);
    log::info!("  GET  /                       - ヘルスチェック");
    log::info!("  POST /upload_and_transcribe  - マルチパート (audio_file) で文字起こし");
    log::info!("  POST /transcribe_url         - JSON {{\"url\": ...}} で文字起こし");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("サーバーの起動に失敗: {}", e))?;

    log::info!("サーバーを停止しました");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("シグナルハンドラの登録に失敗: {}", e);
    }
}

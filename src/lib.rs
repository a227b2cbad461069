// asr_upload_api ライブラリ
// テストから各モジュールにアクセスできるようにするため

pub mod audio;
pub mod config;
pub mod engine;
pub mod handlers;
pub mod models;
pub mod remote;

// whisper関連のモジュールは条件コンパイル
#[cfg(feature = "whisper")]
pub mod whisper;

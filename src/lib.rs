//! cc-captioner - ライブキャプション向けストリーミング文字起こしシステム
//!
//! このクレートは、マイク入力の音声を複数の認識バックエンドへ中継し、
//! 障害時には自動でフォールバックしながらキャプション列を配信する
//! セッションオーケストレータを提供します。
//!
//! # 主な機能
//!
//! - **複数バックエンド**: オンデバイス認識・クラウドストリーミングAPI・ローカル常駐サーバーの3系統
//! - **自動フォールバック**: バックエンド障害を検出して別系統へ切り替え、キャプションを継続
//! - **世代管理**: 切り替え後に届く旧バックエンドの遅延イベントを世代タグで破棄
//! - **キャプション集約**: 部分結果と確定結果を一意なID付きキャプション列へ変換
//! - **JSON配信**: キャプション・途中経過・フォールバック通知を購読者へストリーム配信
//!
//! # アーキテクチャ
//!
//! ```text
//! [Microphone] → [AudioInput] → [CaptionSession]
//!                                      ↓
//!                               [SessionRuntime]
//!                                      ↓
//!                   ┌──────────────────┼──────────────────┐
//!                   │                  │                  │
//!             [OnDevice]        [CloudStream]       [LocalSocket]
//!                   └──────────────────┼──────────────────┘
//!                                      ↓
//!                            [TranscriptAggregator]
//!                                      ↓
//!                             [SessionUpdate配信]
//! ```
//!
//! # 使用例
//!
//! ```no_run
//! use cc_captioner::config::Config;
//!
//! // 設定ファイルを読み込み
//! let config = Config::load_or_default("config.toml").unwrap();
//!
//! // またはデフォルト設定を生成
//! Config::write_default("config.toml").unwrap();
//! ```

pub mod aggregator;
pub mod audio_input;
pub mod cloud_stream;
pub mod config;
pub mod frame_encoder;
pub mod local_socket;
pub mod on_device;
pub mod session;
pub mod transcription_backend;
pub mod types;

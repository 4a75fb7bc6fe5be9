use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime};
use thiserror::Error;

/// 文字起こしバックエンドの種類
///
/// 1つのセッションは常にこのいずれか1つだけをアクティブにする。
///
/// # Examples
///
/// ```
/// # use cc_captioner::types::BackendKind;
/// let kind = BackendKind::OnDevice;
/// assert_ne!(kind, BackendKind::Cloud);
/// ```
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// オンデバイス認識エンジン（外部依存なし・低遅延）
    OnDevice,

    /// クラウドのストリーミング文字起こしAPI
    Cloud,

    /// ユーザーが起動するローカルASRサーバー（WebSocket）
    LocalServer,
}

/// セッションの動作モード
///
/// 固定モードはバックエンド障害時にセッションを停止してエラーを通知する。
/// `AutoResilient` は障害時にフォールバック順序に従って自動で切り替える。
/// モードはセッション実行中は変更できない（停止→再開始が必要）。
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// オンデバイス認識のみ
    FixedOnDevice,

    /// クラウドのみ
    FixedCloud,

    /// ローカルサーバーのみ
    FixedLocal,

    /// 自動フォールバック（オンデバイス → クラウド → オンデバイス）
    AutoResilient,
}

impl Mode {
    /// モード開始時に最初に試すバックエンド
    pub fn initial_backend(&self) -> BackendKind {
        match self {
            Mode::FixedOnDevice => BackendKind::OnDevice,
            Mode::FixedCloud => BackendKind::Cloud,
            Mode::FixedLocal => BackendKind::LocalServer,
            Mode::AutoResilient => BackendKind::OnDevice,
        }
    }
}

/// エラー種別
///
/// バックエンドやキャプチャが報告する障害の分類。
/// フォールバック判定とユーザー通知の両方で使用する。
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 入力デバイスが利用不可、または権限なし
    Device,

    /// クラウドバックエンドに必要な認証情報が未設定
    NoCredential,

    /// 接続先に到達できない（ローカルサーバー未起動など）
    ConnectionRefused,

    /// プラットフォームに必要な機能がない（認識エンジン未注入など）
    Unsupported,

    /// セッション確立後にバックエンド側から報告された障害
    Remote,

    /// 世代カウンタにより破棄された操作
    Cancelled,

    /// 分類できない障害
    Unknown,
}

/// セッションが呼び出し側に返す型付きエラー
///
/// # Examples
///
/// ```
/// # use cc_captioner::types::{ErrorKind, SessionError};
/// let err = SessionError::new(ErrorKind::NoCredential, "APIキーが設定されていません");
/// assert_eq!(err.kind, ErrorKind::NoCredential);
/// ```
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct SessionError {
    /// エラー種別
    pub kind: ErrorKind,

    /// 人間向けの説明
    pub message: String,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// バックエンドが発行する文字起こしイベント
///
/// 1つのバックエンドストリーム内では発行順がそのまま処理順になる。
#[derive(Clone, Debug, PartialEq)]
pub enum TranscriptEvent {
    /// セッション確立完了（音声を受け付けられる状態）
    Opened,

    /// 部分結果（現在の発話の全文。後続で差し替えられる）
    Partial { text: String },

    /// 確定結果（以後変更されないテキスト）
    Final { text: String, confidence: f32 },

    /// バックエンドによる発話区切りの宣言
    TurnComplete,

    /// 障害の報告
    Error { kind: ErrorKind, detail: String },

    /// ストリーム終了
    Closed,
}

/// オーディオフレーム
///
/// キャプチャコールバック1回分のモノラルf32サンプル。
/// エンコーダへ渡した後は保持されない使い捨てのデータ。
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    /// サンプル値（-1.0〜1.0を想定。範囲外はエンコーダでクランプ）
    pub samples: Vec<f32>,

    /// サンプリングレート (Hz)
    pub sample_rate: u32,
}

/// セッションのイベントチャンネルを流れるイベント
///
/// 音声フレーム・バックエンドイベント・タイマー・制御信号のすべてが
/// 1本のチャンネルを通り、到着順に1つずつ処理される。
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// キャプチャからの音声フレーム
    Frame(AudioFrame),

    /// バックエンドからのイベント（発行時点の世代タグ付き）
    Backend {
        generation: u64,
        event: TranscriptEvent,
    },

    /// 接続タイムアウトタイマーの発火
    ConnectTimeout { generation: u64 },

    /// セッション停止要求
    Stop,
}

/// 確定キャプション
///
/// アグリゲータが確定結果ごとに1件だけ生成する。
/// JSON形式でシリアライズして購読者へ配信される。
///
/// # JSON出力例
///
/// ```json
/// {
///   "id": 3,
///   "text": "会議を開始します。",
///   "timestamp": "2025-01-02T14:30:15+00:00",
///   "timestamp_seconds": 15.234,
///   "confidence": 0.9,
///   "is_final": true,
///   "corrected": false
/// }
/// ```
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Caption {
    /// セッション内で一意な連番ID
    pub id: u64,

    /// キャプション本文（後処理フック適用済み）
    pub text: String,

    /// ISO 8601形式のタイムスタンプ
    pub timestamp: String,

    /// セッション開始からの経過秒数（単調増加）
    pub timestamp_seconds: f64,

    /// 信頼度 (0.0〜1.0)
    pub confidence: f32,

    /// 確定済みかどうか（キャプションは常にtrue。途中経過は `SessionUpdate::Interim`）
    pub is_final: bool,

    /// 後処理フックによる訂正が入ったかどうか
    pub corrected: bool,
}

impl Caption {
    /// 新しいキャプションを作成
    ///
    /// # Arguments
    ///
    /// * `id` - セッション内連番
    /// * `text` - 確定テキスト
    /// * `confidence` - 信頼度
    /// * `corrected` - 後処理で訂正されたかどうか
    /// * `started_at` - セッション開始時刻（経過秒数の基準）
    pub fn new(id: u64, text: String, confidence: f32, corrected: bool, started_at: Instant) -> Self {
        let now = SystemTime::now();

        // ISO 8601形式のタイムスタンプを生成
        let timestamp = chrono::DateTime::from_timestamp(
            now.duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64,
            0,
        )
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();

        Self {
            id,
            text,
            timestamp,
            timestamp_seconds: started_at.elapsed().as_secs_f64(),
            confidence,
            is_final: true,
            corrected,
        }
    }
}

/// 購読者へ配信されるセッション更新
///
/// キャプションのほか、途中経過テキスト・フォールバック通知・
/// エラー・セッション終了を1本のストリームで配信する。
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// 未確定の途中経過テキスト（キャプションではない）
    Interim { text: String },

    /// 確定キャプション
    Caption(Caption),

    /// 自動フォールバックの通知
    Fallback {
        from: BackendKind,
        to: BackendKind,
        detail: String,
    },

    /// セッションを停止させたエラー
    Error { kind: ErrorKind, message: String },

    /// セッション終了
    Closed,
}

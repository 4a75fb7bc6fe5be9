use crate::frame_encoder::FrameFormat;
use crate::types::{BackendKind, SessionError, SessionEvent, TranscriptEvent};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 文字起こしバックエンドの共通トレイト
///
/// 3種類のバックエンド（オンデバイス・クラウド・ローカルサーバー）が
/// この能力インターフェースを実装する。継承ではなく設定による選択で
/// 差し替え、テストではモック実装に置き換える。
#[async_trait]
pub trait TranscriptionBackend: Send {
    /// バックエンドの種類を取得
    fn kind(&self) -> BackendKind;

    /// このバックエンドが受け付ける音声フレームのエンコード形式
    fn frame_format(&self) -> FrameFormat;

    /// ストリーミングセッションを開始
    ///
    /// イベント（Opened / Partial / Final / TurnComplete / Error / Closed）は
    /// `events` を通じてセッションのイベントチャンネルへ届く。
    ///
    /// # Returns
    ///
    /// エンコード済み音声フレームの送信チャンネル。
    /// 送信側をドロップするとバックエンドは接続を後始末して終了する。
    ///
    /// # Errors
    ///
    /// 設定不備など、接続を試みる前に判明する失敗を返す。
    /// 非同期に発生する接続失敗は `TranscriptEvent::Error` として届く。
    async fn start_stream(
        &mut self,
        events: EventSender,
    ) -> Result<mpsc::Sender<Vec<u8>>, SessionError>;
}

/// 世代タグ付きイベント送信ハンドル
///
/// バックエンドが発行するイベントに、発行時点の世代を自動で付与する。
/// 世代が古くなったイベントはコントローラ側で無条件に破棄されるため、
/// キャンセル済みの接続試行からの遅延イベントが状態を壊すことはない。
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<SessionEvent>,
    generation: u64,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<SessionEvent>, generation: u64) -> Self {
        Self { tx, generation }
    }

    /// このハンドルに紐づく世代
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// イベントを発行
    ///
    /// セッションが既に終了している場合は黙って破棄する。
    pub async fn emit(&self, event: TranscriptEvent) {
        let _ = self
            .tx
            .send(SessionEvent::Backend {
                generation: self.generation,
                event,
            })
            .await;
    }
}

/// アクティブなバックエンドセッションのハンドル
///
/// 接続リソースの所有（アダプタタスク経由）、世代タグ、
/// 音声フレームシンクをまとめて保持する。
/// 同時にアクティブになるハンドルは常に1つだけ。
pub struct BackendHandle {
    generation: u64,
    backend: Box<dyn TranscriptionBackend>,
    audio_tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl BackendHandle {
    pub fn new(
        backend: Box<dyn TranscriptionBackend>,
        generation: u64,
        audio_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            generation,
            backend,
            audio_tx: Some(audio_tx),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn frame_format(&self) -> FrameFormat {
        self.backend.frame_format()
    }

    /// エンコード済みフレームをバックエンドへ送信（non-blocking）
    ///
    /// シンクが詰まっている場合はブロックせずフレームを破棄して警告を出す。
    pub fn send_audio(&self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        if let Some(tx) = &self.audio_tx {
            match tx.try_send(bytes) {
                Ok(_) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "バックエンド {:?} への音声送信失敗: バッファ満杯",
                        self.kind()
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::debug!("バックエンド {:?} への音声送信失敗: シンククローズ", self.kind());
                }
            }
        }
    }

    /// フレームシンクをクローズしてセッションの終了を指示
    ///
    /// アダプタタスクはチャンネルクローズを検知して接続を閉じる。
    /// 冪等（複数回呼んでも安全）。
    pub fn close(&mut self) {
        self.audio_tx = None;
    }
}

/// バックエンド生成ファクトリ
///
/// コントローラが種類からアダプタ実体を得るための継ぎ目。
/// テストではモックバックエンドを返す実装に差し替える。
pub trait BackendFactory: Send {
    fn create(&mut self, kind: BackendKind) -> Box<dyn TranscriptionBackend>;
}

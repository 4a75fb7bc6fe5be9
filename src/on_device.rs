use crate::frame_encoder::FrameFormat;
use crate::transcription_backend::{EventSender, TranscriptionBackend};
use crate::types::{BackendKind, ErrorKind, SessionError, TranscriptEvent};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// エンジンが信頼度を返さない場合に使う信頼度
const FALLBACK_CONFIDENCE: f32 = 0.9;

/// 連続認識エンジンからの更新
#[derive(Clone, Debug)]
pub enum EngineUpdate {
    /// 部分結果（現在の発話の全文）
    Partial { text: String },

    /// 確定結果
    ///
    /// `confidence` はエンジンが信頼度を返さない場合None。
    Final {
        text: String,
        confidence: Option<f32>,
    },
}

/// 認識エンジンの1セッションの終了理由
#[derive(Clone, Debug)]
pub enum EngineTermination {
    /// 発話の区切りによる正常終了（エンジンは再起動される）
    EndOfUtterance,

    /// 無音検出による終了（エンジンは再起動される）
    NoSpeech,

    /// 中断による終了（エンジンは再起動される）
    Aborted,

    /// 致命的エラー（再起動せず上位へ伝播する）
    Fatal { kind: ErrorKind, detail: String },
}

/// オンデバイス連続認識エンジンの継ぎ目
///
/// プラットフォーム固有の認識機能（OSの音声認識など）をここで注入する。
/// エンジンが用意できない環境では `OnDeviceBackend` が `Unsupported` を返す。
#[async_trait]
pub trait RecognizerEngine: Send + Sync {
    /// 1回の連続認識セッションを実行
    ///
    /// `audio` からPCM16LEフレームを読み取り、`updates` へ部分・確定結果を
    /// 送信する。`audio` がクローズされたら速やかに終了理由を返すこと。
    ///
    /// # Arguments
    ///
    /// * `audio` - PCM16LE音声フレームの受信チャンネル
    /// * `updates` - 認識結果の送信チャンネル
    async fn run_session(
        &self,
        audio: mpsc::Receiver<Vec<u8>>,
        updates: mpsc::Sender<EngineUpdate>,
    ) -> EngineTermination;
}

/// オンデバイス認識バックエンド
///
/// 注入された連続認識エンジンをラップする。発話終了・無音・中断による
/// 終了はセッション継続中であれば自動で再起動し（自己修復ループ）、
/// 致命的エラーのみを `TranscriptEvent::Error` として上位へ伝える。
pub struct OnDeviceBackend {
    engine: Option<Arc<dyn RecognizerEngine>>,
    /// 現在実行中のタスクハンドル（リソースリーク防止用）
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl OnDeviceBackend {
    pub fn new(engine: Option<Arc<dyn RecognizerEngine>>) -> Self {
        Self {
            engine,
            task_handle: None,
        }
    }
}

async fn forward_update(events: &EventSender, update: EngineUpdate) {
    match update {
        EngineUpdate::Partial { text } => {
            events.emit(TranscriptEvent::Partial { text }).await;
        }
        EngineUpdate::Final { text, confidence } => {
            // 信頼度が未報告または0の場合はデフォルト値に置き換える
            let confidence = confidence
                .filter(|c| *c > 0.0)
                .unwrap_or(FALLBACK_CONFIDENCE);
            events.emit(TranscriptEvent::Final { text, confidence }).await;
        }
    }
}

#[async_trait]
impl TranscriptionBackend for OnDeviceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OnDevice
    }

    fn frame_format(&self) -> FrameFormat {
        FrameFormat::Pcm16Le
    }

    async fn start_stream(
        &mut self,
        events: EventSender,
    ) -> Result<mpsc::Sender<Vec<u8>>, SessionError> {
        let engine = match &self.engine {
            Some(engine) => Arc::clone(engine),
            None => {
                return Err(SessionError::new(
                    ErrorKind::Unsupported,
                    "オンデバイス認識エンジンが利用できません",
                ))
            }
        };

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);

        // 古いタスクがあれば破棄（チャンネルクローズにより自動終了）
        if let Some(old_handle) = self.task_handle.take() {
            log::debug!("古いオンデバイス認識タスクを破棄");
            drop(old_handle);
        }

        let handle = tokio::spawn(async move {
            events.emit(TranscriptEvent::Opened).await;

            let mut stopping = false;
            loop {
                let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(64);
                let (update_tx, mut update_rx) = mpsc::channel::<EngineUpdate>(32);
                let mut frame_tx = Some(frame_tx);
                let mut updates_done = false;
                let mut session = Box::pin(engine.run_session(frame_rx, update_tx));

                let termination = loop {
                    tokio::select! {
                        termination = &mut session => break termination,
                        maybe_frame = audio_rx.recv(), if !stopping => {
                            match maybe_frame {
                                Some(bytes) => {
                                    if let Some(tx) = &frame_tx {
                                        if tx.try_send(bytes).is_err() {
                                            log::debug!("認識エンジンへのフレーム送信失敗");
                                        }
                                    }
                                }
                                None => {
                                    // 停止要求: 音声終了を伝えてエンジンの終了を待つ
                                    stopping = true;
                                    frame_tx = None;
                                }
                            }
                        }
                        maybe_update = update_rx.recv(), if !updates_done => {
                            match maybe_update {
                                Some(update) => forward_update(&events, update).await,
                                None => updates_done = true,
                            }
                        }
                    }
                };

                // エンジン終了直前に送られた更新を取りこぼさない
                while let Ok(update) = update_rx.try_recv() {
                    forward_update(&events, update).await;
                }

                match termination {
                    EngineTermination::Fatal { kind, detail } => {
                        log::error!("認識エンジンの致命的エラー: {:?}: {}", kind, detail);
                        events.emit(TranscriptEvent::Error { kind, detail }).await;
                        break;
                    }
                    _ if stopping => {
                        log::debug!("オンデバイス認識を停止");
                        break;
                    }
                    EngineTermination::EndOfUtterance
                    | EngineTermination::NoSpeech
                    | EngineTermination::Aborted => {
                        log::debug!("認識エンジンを再起動: {:?}", termination);
                        continue;
                    }
                }
            }

            events.emit(TranscriptEvent::Closed).await;
        });

        self.task_handle = Some(handle);

        Ok(audio_tx)
    }
}

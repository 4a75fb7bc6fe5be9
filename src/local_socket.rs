use crate::config::LocalServerConfig;
use crate::frame_encoder::FrameFormat;
use crate::transcription_backend::{EventSender, TranscriptionBackend};
use crate::types::{BackendKind, ErrorKind, SessionError, TranscriptEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// ローカルサーバーの確定結果に与える信頼度
const FINAL_CONFIDENCE: f32 = 0.95;

/// ローカルサーバーからのテキスト応答
#[derive(Debug, Deserialize)]
struct ServerText {
    text: Option<String>,
}

/// ローカル常駐認識サーバー接続バックエンド
///
/// WebSocketでPCM16LE音声をバイナリフレームとして送信し、
/// `{"text": "..."}` 形式のテキスト応答を確定結果として受け取る。
/// 認識サーバーの実装（whisper.cppのラッパーなど）には依存しない。
pub struct LocalSocketBackend {
    server_url: String,
    /// 現在実行中のタスクハンドル（リソースリーク防止用）
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl LocalSocketBackend {
    pub fn new(config: &LocalServerConfig) -> Self {
        Self {
            server_url: config.server_url.clone(),
            task_handle: None,
        }
    }
}

async fn handle_text(events: &EventSender, payload: &str) {
    match serde_json::from_str::<ServerText>(payload) {
        Ok(ServerText { text: Some(text) }) if !text.trim().is_empty() => {
            events
                .emit(TranscriptEvent::Final {
                    text,
                    confidence: FINAL_CONFIDENCE,
                })
                .await;
        }
        // textキーなし・空文字列は無視する
        Ok(_) => {}
        Err(err) => {
            log::warn!("ローカルサーバー応答の解析に失敗: {}", err);
        }
    }
}

#[async_trait]
impl TranscriptionBackend for LocalSocketBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalServer
    }

    fn frame_format(&self) -> FrameFormat {
        FrameFormat::Pcm16Le
    }

    async fn start_stream(
        &mut self,
        events: EventSender,
    ) -> Result<mpsc::Sender<Vec<u8>>, SessionError> {
        let url = self.server_url.clone();
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);

        // 古いタスクがあれば破棄（チャンネルクローズにより自動終了）
        if let Some(old_handle) = self.task_handle.take() {
            log::debug!("古いローカルサーバータスクを破棄");
            drop(old_handle);
        }

        let handle = tokio::spawn(async move {
            log::info!("ローカルサーバーに接続します: {}", url);
            let ws = match connect_async(url.as_str()).await {
                Ok((ws, _response)) => ws,
                Err(err) => {
                    log::warn!("ローカルサーバーへの接続に失敗: {}", err);
                    events
                        .emit(TranscriptEvent::Error {
                            kind: ErrorKind::ConnectionRefused,
                            detail: format!("ローカルサーバーに接続できません: {}", err),
                        })
                        .await;
                    events.emit(TranscriptEvent::Closed).await;
                    return;
                }
            };

            events.emit(TranscriptEvent::Opened).await;
            let (mut sink, mut stream) = ws.split();

            loop {
                tokio::select! {
                    maybe_frame = audio_rx.recv() => {
                        match maybe_frame {
                            Some(bytes) => {
                                if let Err(err) = sink.send(Message::Binary(bytes)).await {
                                    log::warn!("ローカルサーバーへの音声送信に失敗: {}", err);
                                    events.emit(TranscriptEvent::Error {
                                        kind: ErrorKind::Remote,
                                        detail: format!("音声送信エラー: {}", err),
                                    }).await;
                                    break;
                                }
                            }
                            None => {
                                // 停止要求
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                    maybe_message = stream.next() => {
                        match maybe_message {
                            Some(Ok(Message::Text(payload))) => {
                                handle_text(&events, &payload).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::warn!("ローカルサーバーとの接続が切断されました");
                                events.emit(TranscriptEvent::Error {
                                    kind: ErrorKind::Remote,
                                    detail: "ローカルサーバーとの接続が切断されました".to_string(),
                                }).await;
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                log::warn!("ローカルサーバーからの受信エラー: {}", err);
                                events.emit(TranscriptEvent::Error {
                                    kind: ErrorKind::Remote,
                                    detail: format!("受信エラー: {}", err),
                                }).await;
                                break;
                            }
                        }
                    }
                }
            }

            events.emit(TranscriptEvent::Closed).await;
        });

        self.task_handle = Some(handle);

        Ok(audio_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionEvent;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn bind_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    fn backend_for(url: String) -> LocalSocketBackend {
        LocalSocketBackend::new(&LocalServerConfig { server_url: url })
    }

    async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> TranscriptEvent {
        match rx.recv().await {
            Some(SessionEvent::Backend { event, .. }) => event,
            other => panic!("予期しないイベント: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delivers_final_from_server_text() {
        let (listener, url) = bind_server().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Binary(bytes) = message {
                    assert_eq!(bytes, vec![0x00, 0x40]);
                    ws.send(Message::Text(
                        "{\"text\":\"ローカル認識結果\"}".to_string(),
                    ))
                    .await
                    .unwrap();
                }
            }
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut backend = backend_for(url);
        let audio_tx = backend
            .start_stream(EventSender::new(events_tx, 0))
            .await
            .unwrap();

        assert_eq!(next_event(&mut events_rx).await, TranscriptEvent::Opened);

        audio_tx.send(vec![0x00, 0x40]).await.unwrap();
        assert_eq!(
            next_event(&mut events_rx).await,
            TranscriptEvent::Final {
                text: "ローカル認識結果".to_string(),
                confidence: FINAL_CONFIDENCE,
            }
        );

        drop(audio_tx);
        assert_eq!(next_event(&mut events_rx).await, TranscriptEvent::Closed);
    }

    #[tokio::test]
    async fn test_ignores_payload_without_text() {
        let (listener, url) = bind_server().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for payload in ["{\"other\":1}", "{\"text\":\"\"}", "{\"text\":\"本文あり\"}"] {
                ws.send(Message::Text(payload.to_string())).await.unwrap();
            }
            while ws.next().await.is_some() {}
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut backend = backend_for(url);
        let audio_tx = backend
            .start_stream(EventSender::new(events_tx, 0))
            .await
            .unwrap();

        assert_eq!(next_event(&mut events_rx).await, TranscriptEvent::Opened);
        // textなし・空文字列の応答を飛ばして本文ありの確定結果だけが届く
        assert_eq!(
            next_event(&mut events_rx).await,
            TranscriptEvent::Final {
                text: "本文あり".to_string(),
                confidence: FINAL_CONFIDENCE,
            }
        );

        drop(audio_tx);
        assert_eq!(next_event(&mut events_rx).await, TranscriptEvent::Closed);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_connection_refused() {
        // 一度バインドして閉じたポートに接続して失敗させる
        let (listener, url) = bind_server().await;
        drop(listener);

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut backend = backend_for(url);
        let _audio_tx = backend
            .start_stream(EventSender::new(events_tx, 0))
            .await
            .unwrap();

        match next_event(&mut events_rx).await {
            TranscriptEvent::Error { kind, .. } => {
                assert_eq!(kind, ErrorKind::ConnectionRefused)
            }
            other => panic!("エラーイベントではない: {:?}", other),
        }
        assert_eq!(next_event(&mut events_rx).await, TranscriptEvent::Closed);
    }

    #[tokio::test]
    async fn test_server_close_reports_remote_error() {
        let (listener, url) = bind_server().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut backend = backend_for(url);
        let _audio_tx = backend
            .start_stream(EventSender::new(events_tx, 0))
            .await
            .unwrap();

        assert_eq!(next_event(&mut events_rx).await, TranscriptEvent::Opened);
        match next_event(&mut events_rx).await {
            TranscriptEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::Remote),
            other => panic!("エラーイベントではない: {:?}", other),
        }
        assert_eq!(next_event(&mut events_rx).await, TranscriptEvent::Closed);
    }
}

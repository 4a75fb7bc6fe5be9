use crate::config::CloudConfig;
use crate::frame_encoder::{FrameFormat, PcmEnvelope};
use crate::transcription_backend::{EventSender, TranscriptionBackend};
use crate::types::{BackendKind, ErrorKind, SessionError, TranscriptEvent};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;

/// 文として確定するのに必要な最小文字数
const MIN_SENTENCE_LEN: usize = 5;

/// 文区切りで確定した結果に与える信頼度
const SENTENCE_CONFIDENCE: f32 = 1.0;

/// サーバーからのメッセージ（必要なフィールドのみ）
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    input_transcription: Option<InputTranscription>,
    turn_complete: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InputTranscription {
    text: Option<String>,
}

/// クラウドストリーミング認識バックエンド
///
/// Gemini Live APIのBidiGenerateContentプロトコルで接続する。
/// セットアップ応答を待ってからストリーム確立とし、入力音声の
/// 文字起こしを蓄積して文末記号で確定結果に変換する。
pub struct CloudStreamBackend {
    api_key: String,
    model: String,
    endpoint: String,
    /// 現在実行中のタスクハンドル（リソースリーク防止用）
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CloudStreamBackend {
    pub fn new(config: &CloudConfig) -> Self {
        Self {
            api_key: config.resolve_api_key(),
            model: config.model.clone(),
            endpoint: config.endpoint.clone(),
            task_handle: None,
        }
    }
}

/// 蓄積したテキストが文として確定できるか判定する
fn is_sentence_end(text: &str) -> bool {
    let trimmed = text.trim_end();
    trimmed.chars().count() > MIN_SENTENCE_LEN && trimmed.ends_with(['.', '!', '?'])
}

/// 接続URLを組み立てる
///
/// APIキーはクエリパラメータとして付与する。パスのないエンドポイントでも
/// リクエストターゲットが `/` から始まるよう、URIを解析してから組み立て直す。
fn keyed_url(endpoint: &str, api_key: &str) -> Result<String, SessionError> {
    let uri: Uri = endpoint.parse().map_err(|err| {
        SessionError::new(
            ErrorKind::Unknown,
            format!("クラウドエンドポイントが不正です: {}", err),
        )
    })?;
    let (scheme, authority) = match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) => (scheme, authority.as_str()),
        _ => {
            return Err(SessionError::new(
                ErrorKind::Unknown,
                format!("クラウドエンドポイントが不正です: {}", endpoint),
            ));
        }
    };
    let url = match uri.query() {
        Some(query) => format!(
            "{}://{}{}?{}&key={}",
            scheme,
            authority,
            uri.path(),
            query,
            api_key
        ),
        None => format!("{}://{}{}?key={}", scheme, authority, uri.path(), api_key),
    };
    Ok(url)
}

/// テキストとして解釈できるペイロードを取り出す
///
/// Live APIはJSONをバイナリフレームで送ることがあるため両方を受ける。
fn text_payload(message: Message) -> Option<String> {
    match message {
        Message::Text(payload) => Some(payload),
        Message::Binary(bytes) => String::from_utf8(bytes).ok(),
        _ => None,
    }
}

async fn handle_server_message(events: &EventSender, turn_text: &mut String, payload: &str) {
    let parsed: ServerMessage = match serde_json::from_str(payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::warn!("サーバーメッセージの解析に失敗: {}", err);
            return;
        }
    };
    let content = match parsed.server_content {
        Some(content) => content,
        None => return,
    };

    if let Some(chunk) = content.input_transcription.and_then(|t| t.text) {
        if !chunk.is_empty() {
            turn_text.push_str(&chunk);
            if is_sentence_end(turn_text) {
                let text = std::mem::take(turn_text);
                events
                    .emit(TranscriptEvent::Final {
                        text,
                        confidence: SENTENCE_CONFIDENCE,
                    })
                    .await;
            } else {
                events
                    .emit(TranscriptEvent::Partial {
                        text: turn_text.clone(),
                    })
                    .await;
            }
        }
    }

    if content.turn_complete.unwrap_or(false) {
        turn_text.clear();
        events.emit(TranscriptEvent::TurnComplete).await;
    }
}

#[async_trait]
impl TranscriptionBackend for CloudStreamBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn frame_format(&self) -> FrameFormat {
        FrameFormat::Base64Json
    }

    async fn start_stream(
        &mut self,
        events: EventSender,
    ) -> Result<mpsc::Sender<Vec<u8>>, SessionError> {
        if self.api_key.is_empty() {
            return Err(SessionError::new(
                ErrorKind::NoCredential,
                "クラウドAPIキーが設定されていません（設定ファイルまたはGEMINI_API_KEY環境変数で指定）",
            ));
        }

        let url = keyed_url(&self.endpoint, &self.api_key)?;
        let endpoint = self.endpoint.clone();
        let model = self.model.clone();
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);

        // 古いタスクがあれば破棄（チャンネルクローズにより自動終了）
        if let Some(old_handle) = self.task_handle.take() {
            log::debug!("古いクラウドストリーミングタスクを破棄");
            drop(old_handle);
        }

        let handle = tokio::spawn(async move {
            log::info!("クラウドストリーミングに接続します: {}", endpoint);
            let ws = match connect_async(url.as_str()).await {
                Ok((ws, _response)) => ws,
                Err(err) => {
                    let (kind, detail) = match &err {
                        WsError::Http(response)
                            if matches!(response.status().as_u16(), 401 | 403) =>
                        {
                            (
                                ErrorKind::NoCredential,
                                format!("APIキーが拒否されました (HTTP {})", response.status()),
                            )
                        }
                        _ => (
                            ErrorKind::ConnectionRefused,
                            format!("クラウドストリーミングに接続できません: {}", err),
                        ),
                    };
                    log::warn!("クラウド接続エラー: {}", detail);
                    events.emit(TranscriptEvent::Error { kind, detail }).await;
                    events.emit(TranscriptEvent::Closed).await;
                    return;
                }
            };

            let (mut sink, mut stream) = ws.split();

            // セットアップメッセージを送ってsetupCompleteを待つ
            let setup = serde_json::json!({
                "setup": {
                    "model": format!("models/{}", model),
                    "generationConfig": { "responseModalities": ["TEXT"] },
                    "inputAudioTranscription": {}
                }
            });
            if let Err(err) = sink.send(Message::Text(setup.to_string())).await {
                log::warn!("セットアップメッセージの送信に失敗: {}", err);
                events
                    .emit(TranscriptEvent::Error {
                        kind: ErrorKind::ConnectionRefused,
                        detail: format!("セットアップ送信エラー: {}", err),
                    })
                    .await;
                events.emit(TranscriptEvent::Closed).await;
                return;
            }
            loop {
                tokio::select! {
                    maybe_frame = audio_rx.recv() => {
                        match maybe_frame {
                            // セットアップ完了前のフレームは破棄する
                            Some(_) => {}
                            None => {
                                // 停止要求: 接続を閉じてタスクを終了する
                                log::debug!("セットアップ完了前に停止要求を受信");
                                let _ = sink.send(Message::Close(None)).await;
                                events.emit(TranscriptEvent::Closed).await;
                                return;
                            }
                        }
                    }
                    maybe_message = stream.next() => {
                        match maybe_message {
                            Some(Ok(message)) => {
                                if let Some(payload) = text_payload(message) {
                                    match serde_json::from_str::<ServerMessage>(&payload) {
                                        Ok(parsed) if parsed.setup_complete.is_some() => break,
                                        Ok(_) => {}
                                        Err(err) => {
                                            log::warn!("セットアップ応答の解析に失敗: {}", err)
                                        }
                                    }
                                }
                            }
                            Some(Err(err)) => {
                                log::warn!("セットアップ中の受信エラー: {}", err);
                                events.emit(TranscriptEvent::Error {
                                    kind: ErrorKind::ConnectionRefused,
                                    detail: format!("セットアップ中の受信エラー: {}", err),
                                }).await;
                                events.emit(TranscriptEvent::Closed).await;
                                return;
                            }
                            None => {
                                log::warn!("セットアップ完了前に切断されました");
                                events.emit(TranscriptEvent::Error {
                                    kind: ErrorKind::ConnectionRefused,
                                    detail: "セットアップ完了前に切断されました".to_string(),
                                }).await;
                                events.emit(TranscriptEvent::Closed).await;
                                return;
                            }
                        }
                    }
                }
            }

            log::info!("クラウドストリーミングのセットアップが完了しました");
            events.emit(TranscriptEvent::Opened).await;

            let mut turn_text = String::new();
            loop {
                tokio::select! {
                    maybe_frame = audio_rx.recv() => {
                        match maybe_frame {
                            Some(bytes) => {
                                let envelope: PcmEnvelope = match serde_json::from_slice(&bytes) {
                                    Ok(envelope) => envelope,
                                    Err(err) => {
                                        log::error!("音声エンベロープの解析に失敗: {}", err);
                                        continue;
                                    }
                                };
                                let message = serde_json::json!({
                                    "realtimeInput": { "audio": envelope }
                                });
                                if let Err(err) = sink.send(Message::Text(message.to_string())).await {
                                    log::warn!("クラウドへの音声送信に失敗: {}", err);
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
                            Some(Ok(Message::Close(_))) | None => {
                                log::warn!("クラウドストリーミングが切断されました");
                                events.emit(TranscriptEvent::Error {
                                    kind: ErrorKind::Remote,
                                    detail: "クラウドストリーミングが切断されました".to_string(),
                                }).await;
                                break;
                            }
                            Some(Ok(message)) => {
                                if let Some(payload) = text_payload(message) {
                                    handle_server_message(&events, &mut turn_text, &payload).await;
                                }
                            }
                            Some(Err(err)) => {
                                log::warn!("クラウドからの受信エラー: {}", err);
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
    use crate::frame_encoder::encode;
    use crate::types::{AudioFrame, SessionEvent};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::http::StatusCode;

    fn backend_for(api_key: &str, endpoint: &str) -> CloudStreamBackend {
        CloudStreamBackend {
            api_key: api_key.to_string(),
            model: "test-model".to_string(),
            endpoint: endpoint.to_string(),
            task_handle: None,
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> TranscriptEvent {
        match rx.recv().await {
            Some(SessionEvent::Backend { event, .. }) => event,
            other => panic!("予期しないイベント: {:?}", other),
        }
    }

    #[test]
    fn test_sentence_end_detection() {
        assert!(is_sentence_end("Hello, world."));
        assert!(is_sentence_end("六文字です."));
        assert!(is_sentence_end("Done here!  "));
        assert!(!is_sentence_end("Hi."));
        assert!(!is_sentence_end("Hello world"));
        assert!(!is_sentence_end(""));
    }

    #[test]
    fn test_keyed_url_always_targets_a_path() {
        // パスのないエンドポイントではリクエストターゲットを `/` にする
        assert_eq!(
            keyed_url("ws://localhost:9000", "abc").unwrap(),
            "ws://localhost:9000/?key=abc"
        );
        assert_eq!(
            keyed_url("wss://example.com/v1beta/live", "abc").unwrap(),
            "wss://example.com/v1beta/live?key=abc"
        );
        // 既存のクエリには & で連結する
        assert_eq!(
            keyed_url("wss://example.com/live?alt=json", "abc").unwrap(),
            "wss://example.com/live?alt=json&key=abc"
        );
        assert!(keyed_url("", "abc").is_err());
    }

    #[tokio::test]
    async fn test_missing_api_key_is_no_credential() {
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut backend = backend_for("", "ws://localhost:1");

        let result = backend
            .start_stream(EventSender::new(events_tx, 0))
            .await;

        match result {
            Err(err) => assert_eq!(err.kind, ErrorKind::NoCredential),
            Ok(_) => panic!("APIキーなしで開始できてしまった"),
        }
    }

    #[tokio::test]
    async fn test_handshake_and_transcription_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            // セットアップメッセージの形を確認してsetupCompleteを返す
            let first = ws.next().await.unwrap().unwrap();
            let payload = match first {
                Message::Text(payload) => payload,
                other => panic!("テキストフレームではない: {:?}", other),
            };
            let setup: serde_json::Value = serde_json::from_str(&payload).unwrap();
            assert_eq!(setup["setup"]["model"], "models/test-model");
            assert!(setup["setup"]["inputAudioTranscription"].is_object());
            ws.send(Message::Text("{\"setupComplete\":{}}".to_string()))
                .await
                .unwrap();

            // 音声エンベロープの形を確認する
            let audio = ws.next().await.unwrap().unwrap();
            let payload = match audio {
                Message::Text(payload) => payload,
                other => panic!("テキストフレームではない: {:?}", other),
            };
            let message: serde_json::Value = serde_json::from_str(&payload).unwrap();
            assert_eq!(
                message["realtimeInput"]["audio"]["mimeType"],
                "audio/pcm;rate=16000"
            );
            assert!(message["realtimeInput"]["audio"]["data"].is_string());

            for payload in [
                "{\"serverContent\":{\"inputTranscription\":{\"text\":\"こんにちは\"}}}",
                "{\"serverContent\":{\"inputTranscription\":{\"text\":\"、世界です.\"}}}",
                "{\"serverContent\":{\"turnComplete\":true}}",
            ] {
                ws.send(Message::Text(payload.to_string())).await.unwrap();
            }
            while ws.next().await.is_some() {}
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut backend = backend_for("test-key", &url);
        let audio_tx = backend
            .start_stream(EventSender::new(events_tx, 0))
            .await
            .unwrap();

        assert_eq!(next_event(&mut events_rx).await, TranscriptEvent::Opened);

        let frame = AudioFrame {
            samples: vec![0.5],
            sample_rate: 16000,
        };
        audio_tx
            .send(encode(&frame, FrameFormat::Base64Json))
            .await
            .unwrap();

        // 文末記号までは部分結果、到達したら信頼度1.0の確定結果になる
        assert_eq!(
            next_event(&mut events_rx).await,
            TranscriptEvent::Partial {
                text: "こんにちは".to_string(),
            }
        );
        assert_eq!(
            next_event(&mut events_rx).await,
            TranscriptEvent::Final {
                text: "こんにちは、世界です.".to_string(),
                confidence: SENTENCE_CONFIDENCE,
            }
        );
        assert_eq!(
            next_event(&mut events_rx).await,
            TranscriptEvent::TurnComplete
        );

        drop(audio_tx);
        assert_eq!(next_event(&mut events_rx).await, TranscriptEvent::Closed);
    }

    #[tokio::test]
    async fn test_drop_during_setup_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // setupCompleteを返さずにクライアント側のクローズを待つ
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut backend = backend_for("test-key", &url);
        let audio_tx = backend
            .start_stream(EventSender::new(events_tx, 0))
            .await
            .unwrap();

        // セットアップ待ちのまま送信側を落としても接続ごと後始末される
        drop(audio_tx);
        assert_eq!(next_event(&mut events_rx).await, TranscriptEvent::Closed);
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("サーバーがクローズを観測できなかった")
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_key_reports_no_credential() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            use tokio_tungstenite::tungstenite::handshake::server::{
                ErrorResponse, Request, Response,
            };
            let (stream, _) = listener.accept().await.unwrap();
            let _ = tokio_tungstenite::accept_hdr_async(
                stream,
                |_request: &Request, _response: Response| {
                    let mut rejection = ErrorResponse::new(Some("unauthorized".to_string()));
                    *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(rejection)
                },
            )
            .await;
        });

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut backend = backend_for("bad-key", &url);
        let _audio_tx = backend
            .start_stream(EventSender::new(events_tx, 0))
            .await
            .unwrap();

        match next_event(&mut events_rx).await {
            TranscriptEvent::Error { kind, .. } => {
                assert_eq!(kind, ErrorKind::NoCredential)
            }
            other => panic!("エラーイベントではない: {:?}", other),
        }
        assert_eq!(next_event(&mut events_rx).await, TranscriptEvent::Closed);
    }
}

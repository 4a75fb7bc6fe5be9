use crate::aggregator::{CaptionPostProcessor, TranscriptAggregator};
use crate::audio_input::AudioInput;
use crate::cloud_stream::CloudStreamBackend;
use crate::config::{CloudConfig, Config, LocalServerConfig};
use crate::frame_encoder::encode;
use crate::local_socket::LocalSocketBackend;
use crate::on_device::{OnDeviceBackend, RecognizerEngine};
use crate::transcription_backend::{
    BackendFactory, BackendHandle, EventSender, TranscriptionBackend,
};
use crate::types::{
    AudioFrame, BackendKind, ErrorKind, Mode, SessionError, SessionEvent, SessionUpdate,
    TranscriptEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// イベントチャンネルの容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 購読チャンネルの容量
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// 戦略コントローラの状態
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// 未開始
    Idle,

    /// バックエンドを起動中（Opened待ち）
    Starting(BackendKind),

    /// バックエンドがアクティブで音声を転送中
    Active(BackendKind),

    /// フォールバック先への切り替え中
    SwitchingTo(BackendKind),

    /// 停止済み
    Stopped,
}

/// 自動フォールバックの試行状態
///
/// 同一サイクル内で失敗したバックエンドを記録し、失敗済みバックエンドへの
/// 後退を防ぐ。いずれかのバックエンドがアクティブに到達したらクリアする。
struct ResilienceState {
    failed: Vec<BackendKind>,
}

impl ResilienceState {
    fn new() -> Self {
        Self { failed: Vec::new() }
    }

    /// 失敗を記録し、次に試すバックエンドを返す
    ///
    /// フォールバック順はオンデバイス→クラウド、クラウド→オンデバイス、
    /// ローカルサーバー→オンデバイス。次の候補が同一サイクル内で
    /// すでに失敗していればNone。
    fn next_after_failure(&mut self, kind: BackendKind) -> Option<BackendKind> {
        if !self.failed.contains(&kind) {
            self.failed.push(kind);
        }
        let next = match kind {
            BackendKind::OnDevice => BackendKind::Cloud,
            BackendKind::Cloud => BackendKind::OnDevice,
            BackendKind::LocalServer => BackendKind::OnDevice,
        };
        if self.failed.contains(&next) {
            None
        } else {
            Some(next)
        }
    }

    fn clear(&mut self) {
        self.failed.clear();
    }
}

/// セッションランタイム（戦略コントローラ）
///
/// 1本のイベントチャンネルを到着順に読み、バックエンドの起動・監視・
/// フォールバック・停止を状態機械として駆動する。イベントは1つずつ
/// 処理されるため、状態遷移の競合は起きない。
struct SessionRuntime {
    mode: Mode,
    connect_timeout: Duration,
    state: SessionState,
    /// 現在の世代。バックエンドを起動するたびに進む
    generation: u64,
    resilience: ResilienceState,
    factory: Box<dyn BackendFactory>,
    active: Option<BackendHandle>,
    aggregator: TranscriptAggregator,
    events_tx: mpsc::Sender<SessionEvent>,
    updates_tx: broadcast::Sender<SessionUpdate>,
}

impl SessionRuntime {
    fn new(
        config: &Config,
        factory: Box<dyn BackendFactory>,
        post: Box<dyn CaptionPostProcessor>,
        events_tx: mpsc::Sender<SessionEvent>,
        updates_tx: broadcast::Sender<SessionUpdate>,
    ) -> Self {
        Self {
            mode: config.session.mode,
            connect_timeout: Duration::from_secs(config.session.connect_timeout_seconds),
            state: SessionState::Idle,
            generation: 0,
            resilience: ResilienceState::new(),
            factory,
            active: None,
            aggregator: TranscriptAggregator::new(post),
            events_tx,
            updates_tx,
        }
    }

    fn publish(&self, update: SessionUpdate) {
        // 購読者がいない場合の送信エラーは無視する
        let _ = self.updates_tx.send(update);
    }

    /// モードの初期バックエンドを起動する
    async fn begin(&mut self) {
        self.launch(self.mode.initial_backend()).await;
    }

    /// バックエンドを起動する
    ///
    /// 同期的な起動失敗はその場でフォールバック方針に従って次の候補を
    /// 試す。候補が尽きるかセッションが停止したら戻る。
    async fn launch(&mut self, kind: BackendKind) {
        let mut kind = kind;
        loop {
            match self.try_start(kind).await {
                Ok(()) => return,
                Err(err) => {
                    log::warn!("バックエンド{:?}の起動に失敗: {}", kind, err);
                    match self.handle_backend_failure(kind, err) {
                        Some(next) => kind = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// 新しい世代でバックエンドを1つ起動する
    async fn try_start(&mut self, kind: BackendKind) -> Result<(), SessionError> {
        self.generation += 1;
        let generation = self.generation;
        self.state = SessionState::Starting(kind);
        log::info!("バックエンド{:?}を起動します (世代{})", kind, generation);

        let mut backend = self.factory.create(kind);
        let events = EventSender::new(self.events_tx.clone(), generation);
        let audio_tx = backend.start_stream(events).await?;
        self.active = Some(BackendHandle::new(backend, generation, audio_tx));

        // 接続タイムアウトタイマー。世代タグ付きなので遅延発火しても無害
        let timeout_tx = self.events_tx.clone();
        let timeout = self.connect_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = timeout_tx
                .send(SessionEvent::ConnectTimeout { generation })
                .await;
        });

        Ok(())
    }

    /// バックエンド障害を処理し、次に試すバックエンドを返す
    ///
    /// 固定モード・認証情報エラー・候補切れの場合はセッションを停止して
    /// エラーを配信し、Noneを返す。
    fn handle_backend_failure(
        &mut self,
        kind: BackendKind,
        error: SessionError,
    ) -> Option<BackendKind> {
        // 切り替え時に未確定の途中経過は破棄する
        self.aggregator.discard_pending();
        if let Some(mut handle) = self.active.take() {
            handle.close();
        }

        if self.mode != Mode::AutoResilient {
            self.publish(SessionUpdate::Error {
                kind: error.kind,
                message: error.message,
            });
            self.stop_session();
            return None;
        }

        if error.kind == ErrorKind::NoCredential {
            // 認証情報の不備は設定の問題としてそのまま通知する
            self.publish(SessionUpdate::Error {
                kind: error.kind,
                message: error.message,
            });
            self.stop_session();
            return None;
        }

        match self.resilience.next_after_failure(kind) {
            Some(next) => {
                log::info!("{:?}から{:?}へフォールバックします", kind, next);
                self.state = SessionState::SwitchingTo(next);
                self.publish(SessionUpdate::Fallback {
                    from: kind,
                    to: next,
                    detail: error.message,
                });
                Some(next)
            }
            None => {
                log::error!("利用可能なバックエンドがありません");
                self.publish(SessionUpdate::Error {
                    kind: error.kind,
                    message: format!(
                        "すべてのバックエンドが失敗しました（最後のエラー: {}）",
                        error.message
                    ),
                });
                self.stop_session();
                None
            }
        }
    }

    /// 非同期障害を処理してフォールバックを起動する
    async fn fail_over(&mut self, kind: BackendKind, error: SessionError) {
        if let Some(next) = self.handle_backend_failure(kind, error) {
            self.launch(next).await;
        }
    }

    /// 現在監視中のバックエンド種別（起動中・切り替え中を含む）
    fn current_backend(&self) -> Option<BackendKind> {
        match self.state {
            SessionState::Starting(kind)
            | SessionState::Active(kind)
            | SessionState::SwitchingTo(kind) => Some(kind),
            SessionState::Idle | SessionState::Stopped => None,
        }
    }

    /// イベントを1件処理する。セッションが継続するならtrue
    async fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Frame(frame) => self.handle_frame(frame),
            SessionEvent::Backend { generation, event } => {
                if generation != self.generation {
                    // 旧世代のバックエンドからの遅延イベントは破棄する
                    log::debug!("旧世代{}のイベントを破棄: {:?}", generation, event);
                } else {
                    self.handle_transcript_event(event).await;
                }
            }
            SessionEvent::ConnectTimeout { generation } => {
                self.handle_connect_timeout(generation).await;
            }
            SessionEvent::Stop => self.stop_session(),
        }
        self.state != SessionState::Stopped
    }

    fn handle_frame(&mut self, frame: AudioFrame) {
        // アクティブなバックエンドがある場合だけ転送し、それ以外は破棄する
        if let SessionState::Active(_) = self.state {
            if let Some(handle) = &self.active {
                let bytes = encode(&frame, handle.frame_format());
                handle.send_audio(bytes);
            }
        }
    }

    /// 現行世代のバックエンドイベントを処理する
    async fn handle_transcript_event(&mut self, event: TranscriptEvent) {
        match event {
            TranscriptEvent::Opened => {
                if let SessionState::Starting(kind) = self.state {
                    log::info!("バックエンド{:?}がアクティブになりました", kind);
                    self.state = SessionState::Active(kind);
                    self.resilience.clear();
                } else {
                    log::debug!("状態{:?}でOpenedを受信", self.state);
                }
            }
            TranscriptEvent::Partial { text } => {
                let interim = self.aggregator.on_partial(&text);
                self.publish(SessionUpdate::Interim { text: interim });
            }
            TranscriptEvent::Final { text, confidence } => {
                if let Some(caption) = self.aggregator.on_final(&text, confidence) {
                    log::debug!("キャプション確定: [{}] {}", caption.id, caption.text);
                    self.publish(SessionUpdate::Caption(caption));
                }
            }
            TranscriptEvent::TurnComplete => {
                if let Some(caption) = self.aggregator.on_turn_complete() {
                    log::debug!("ターン完了で確定: [{}] {}", caption.id, caption.text);
                    self.publish(SessionUpdate::Caption(caption));
                }
            }
            TranscriptEvent::Error { kind, detail } => {
                let backend = match self.current_backend() {
                    Some(backend) => backend,
                    None => {
                        log::debug!("状態{:?}でエラーイベントを受信: {:?}", self.state, kind);
                        return;
                    }
                };
                log::warn!("バックエンド{:?}でエラー: {:?}: {}", backend, kind, detail);
                self.fail_over(backend, SessionError::new(kind, detail)).await;
            }
            TranscriptEvent::Closed => {
                // 停止やフォールバックの後始末では世代が進んでいるため、
                // ここに届く現行世代のClosedは予期しない切断を意味する
                let backend = match self.current_backend() {
                    Some(backend) => backend,
                    None => return,
                };
                log::warn!("バックエンド{:?}が予期せず終了しました", backend);
                self.fail_over(
                    backend,
                    SessionError::new(ErrorKind::Remote, "バックエンドが予期せず終了しました"),
                )
                .await;
            }
        }
    }

    /// 接続タイムアウトの発火を処理する
    ///
    /// 現行世代かつOpened前の場合だけ接続失敗として扱う。
    async fn handle_connect_timeout(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        if let SessionState::Starting(kind) = self.state {
            log::warn!("バックエンド{:?}の接続がタイムアウトしました", kind);
            self.fail_over(
                kind,
                SessionError::new(ErrorKind::ConnectionRefused, "接続タイムアウト"),
            )
            .await;
        }
    }

    /// セッションを停止する。冪等
    fn stop_session(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        log::info!("セッションを停止します");
        if let Some(mut handle) = self.active.take() {
            handle.close();
        }
        self.aggregator.discard_pending();
        self.resilience.clear();
        // 以降に届く旧バックエンドのイベントをすべて無効化する
        self.generation += 1;
        self.state = SessionState::Stopped;
        self.publish(SessionUpdate::Closed);
    }

    /// イベントループ本体
    async fn run(mut self, mut events_rx: mpsc::Receiver<SessionEvent>) {
        self.begin().await;
        while self.state != SessionState::Stopped {
            match events_rx.recv().await {
                Some(event) => {
                    if !self.handle_event(event).await {
                        break;
                    }
                }
                None => {
                    // 全送信側が消えた場合も停止してClosedを配信する
                    self.stop_session();
                    break;
                }
            }
        }
        log::debug!("セッションランタイムを終了");
    }
}

/// 設定からバックエンドを生成する標準ファクトリ
pub struct DefaultBackendFactory {
    cloud: CloudConfig,
    local: LocalServerConfig,
    engine: Option<Arc<dyn RecognizerEngine>>,
}

impl DefaultBackendFactory {
    pub fn new(config: &Config) -> Self {
        Self {
            cloud: config.cloud.clone(),
            local: config.local.clone(),
            engine: None,
        }
    }

    /// オンデバイス認識エンジンを注入する
    ///
    /// 注入しない場合、オンデバイスバックエンドは起動時に
    /// `Unsupported` エラーを返す。
    pub fn with_engine(mut self, engine: Arc<dyn RecognizerEngine>) -> Self {
        self.engine = Some(engine);
        self
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create(&mut self, kind: BackendKind) -> Box<dyn TranscriptionBackend> {
        match kind {
            BackendKind::OnDevice => Box::new(OnDeviceBackend::new(self.engine.clone())),
            BackendKind::Cloud => Box::new(CloudStreamBackend::new(&self.cloud)),
            BackendKind::LocalServer => Box::new(LocalSocketBackend::new(&self.local)),
        }
    }
}

/// ライブキャプションセッション
///
/// 音声キャプチャとセッションランタイムを束ねる公開ハンドル。
/// cpalのストリームはスレッドをまたげないため、キャプチャは
/// 呼び出し元スレッドに留まり、ランタイムだけがtokioタスクとして動く。
///
/// # Examples
///
/// ```no_run
/// use cc_captioner::aggregator::PassthroughPostProcessor;
/// use cc_captioner::config::Config;
/// use cc_captioner::session::{CaptionSession, DefaultBackendFactory};
///
/// # async fn example() -> Result<(), cc_captioner::types::SessionError> {
/// let config = Config::default();
/// let factory = Box::new(DefaultBackendFactory::new(&config));
/// let mut session = CaptionSession::start(&config, factory, Box::new(PassthroughPostProcessor))?;
///
/// let mut updates = session.subscribe();
/// while let Ok(update) = updates.recv().await {
///     println!("{:?}", update);
/// }
///
/// session.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct CaptionSession {
    events_tx: mpsc::Sender<SessionEvent>,
    updates_tx: broadcast::Sender<SessionUpdate>,
    /// セッション開始時点から購読している受信側。最初の `subscribe()` で払い出す
    updates_rx: Option<broadcast::Receiver<SessionUpdate>>,
    capture: AudioInput,
    run_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CaptionSession {
    /// セッションを開始
    ///
    /// 音声キャプチャを起動し、設定されたモードの初期バックエンドへの
    /// 接続を開始する。tokioランタイム上で呼び出すこと。
    ///
    /// # Arguments
    ///
    /// * `config` - セッション設定
    /// * `factory` - バックエンド生成ファクトリ
    /// * `post` - 確定テキストの後処理フック
    pub fn start(
        config: &Config,
        factory: Box<dyn BackendFactory>,
        post: Box<dyn CaptionPostProcessor>,
    ) -> Result<Self, SessionError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // 受信側をランタイム起動前に確保し、開始直後の更新を取りこぼさない
        let (updates_tx, updates_rx) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        let mut capture = AudioInput::new(&config.audio).map_err(|err| {
            SessionError::new(ErrorKind::Device, format!("入力デバイスを開けません: {:#}", err))
        })?;
        capture.start(events_tx.clone()).map_err(|err| {
            SessionError::new(
                ErrorKind::Device,
                format!("音声キャプチャを開始できません: {:#}", err),
            )
        })?;

        let runtime = SessionRuntime::new(
            config,
            factory,
            post,
            events_tx.clone(),
            updates_tx.clone(),
        );
        let run_handle = tokio::spawn(runtime.run(events_rx));

        Ok(Self {
            events_tx,
            updates_tx,
            updates_rx: Some(updates_rx),
            capture,
            run_handle: Some(run_handle),
        })
    }

    /// セッション更新の購読を開始
    ///
    /// 最初の呼び出しはセッション開始時点から購読している受信側を返すため、
    /// 開始直後に配信された更新（起動失敗のエラーや `Closed` など）も届く。
    /// 2回目以降の呼び出しは、その時点からの購読になる。
    pub fn subscribe(&mut self) -> broadcast::Receiver<SessionUpdate> {
        match self.updates_rx.take() {
            Some(updates_rx) => updates_rx,
            None => self.updates_tx.subscribe(),
        }
    }

    /// セッションを停止
    ///
    /// 冪等。音声キャプチャを解放し、ランタイムに停止を要求して
    /// 終了を待つ。最後の `SessionUpdate::Closed` は停止処理の中で
    /// 配信される。
    pub async fn stop(&mut self) {
        self.capture.stop();
        let _ = self.events_tx.send(SessionEvent::Stop).await;
        if let Some(handle) = self.run_handle.take() {
            let _ = handle.await;
        }
    }
}

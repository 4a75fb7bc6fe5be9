use crate::config::AudioConfig;
use crate::types::{AudioFrame, SessionEvent};
use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SizedSample};
use tokio::sync::mpsc;

/// オーディオデバイスからのモノラル音声キャプチャ
///
/// キャプチャコールバックが受け取ったサンプルをf32のフレームとして
/// セッションのイベントチャンネルへ非ブロッキングで送り込む。
/// 入力デバイスはこの構造体が排他的に所有し、`stop()` または
/// ドロップで確実に解放される。
pub struct AudioInput {
    device: cpal::Device,
    config: cpal::StreamConfig,
    stream: Option<cpal::Stream>,
}

impl AudioInput {
    /// 新しいAudioInputを作成
    ///
    /// デバイスの取得までを行い、ストリームはまだ開かない。
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        // デバイスを取得
        let device = if config.device_id == "default" {
            host.default_input_device()
                .context("デフォルト入力デバイスが見つかりません")?
        } else {
            // デバイスIDが指定されている場合は、デバイス一覧から検索
            Self::input_devices()?
                .into_iter()
                .find(|d| d.name().ok().as_deref() == Some(config.device_id.as_str()))
                .with_context(|| format!("デバイスが見つかりません: {}", config.device_id))?
        };

        let device_name = device.name().unwrap_or_else(|_| "不明".to_string());
        log::info!("入力デバイス: {}", device_name);

        // デバイスの設定を取得
        let default_config = device
            .default_input_config()
            .context("デフォルト入力設定が取得できません")?;

        log::info!(
            "デバイス設定: {:?}, {}Hz, {}ch",
            default_config.sample_format(),
            default_config.sample_rate().0,
            default_config.channels()
        );

        // ストリーム設定を作成（モノラル固定）
        let stream_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(4096),
        };

        Ok(Self {
            device,
            config: stream_config,
            stream: None,
        })
    }

    /// キャプチャを開始
    ///
    /// # Arguments
    /// * `events` - セッションのイベントチャンネル（`SessionEvent::Frame` を送信）
    pub fn start(&mut self, events: mpsc::Sender<SessionEvent>) -> Result<()> {
        let sample_rate = self.config.sample_rate.0;

        // デバイスのデフォルトフォーマットを取得
        let default_config = self.device.default_input_config()?;

        let stream = match default_config.sample_format() {
            cpal::SampleFormat::F32 => self.build_stream::<f32>(events, sample_rate)?,
            cpal::SampleFormat::I16 => self.build_stream::<i16>(events, sample_rate)?,
            cpal::SampleFormat::U16 => self.build_stream::<u16>(events, sample_rate)?,
            cpal::SampleFormat::I32 => self.build_stream::<i32>(events, sample_rate)?,
            _ => anyhow::bail!("サポートされていないサンプルフォーマット"),
        };

        stream.play().context("ストリームの再生開始に失敗")?;
        self.stream = Some(stream);

        log::info!("音声キャプチャを開始しました");

        Ok(())
    }

    /// ストリームを構築
    fn build_stream<T>(
        &self,
        events: mpsc::Sender<SessionEvent>,
        sample_rate: u32,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + Sample + Send + 'static,
        <T as Sample>::Float: Into<f32>,
    {
        let data_callback = move |data: &[T], _info: &cpal::InputCallbackInfo| {
            let mut samples = Vec::with_capacity(data.len());
            for &sample in data {
                let f: f32 = sample.to_float_sample().into();
                samples.push(f);
            }

            let frame = AudioFrame {
                samples,
                sample_rate,
            };

            // 非同期送信（オーディオスレッドをブロックしない）
            match events.try_send(SessionEvent::Frame(frame)) {
                Ok(_) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("音声フレームの送信失敗: イベントチャンネル満杯");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::warn!("音声フレームの送信失敗: イベントチャンネルクローズ");
                }
            }
        };

        let error_callback = move |err| {
            log::error!("キャプチャストリームエラー: {}", err);
        };

        let stream = self
            .device
            .build_input_stream(&self.config, data_callback, error_callback, None)
            .context("入力ストリームの構築に失敗")?;

        Ok(stream)
    }

    /// キャプチャを停止
    ///
    /// 冪等。複数回呼んでも安全で、ハードウェアリソースを解放する。
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            log::info!("音声キャプチャを停止しました");
        }
    }

    /// デバイス一覧を表示
    pub fn list_devices() -> Result<()> {
        println!("利用可能な入力デバイス:");
        println!();

        for (idx, device) in Self::input_devices()?.into_iter().enumerate() {
            let name = device.name()?;
            println!("  [{}] {}", idx, name);

            device.supported_input_configs()?.for_each(|config_range| {
                println!(
                    "      フォーマット: {:?}, {}-{}Hz, {}ch",
                    config_range.sample_format(),
                    config_range.min_sample_rate().0,
                    config_range.max_sample_rate().0,
                    config_range.channels()
                );
            });
            println!();
        }

        Ok(())
    }

    /// 入力デバイス一覧を取得
    fn input_devices() -> Result<Vec<cpal::Device>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?.collect();
        Ok(devices)
    }
}

impl Drop for AudioInput {
    fn drop(&mut self) {
        self.stop();
    }
}

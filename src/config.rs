use crate::types::Mode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub local: LocalServerConfig,
}

/// オーディオ入力設定
///
/// キャプチャデバイスからの入力に関する設定。
///
/// # デフォルト値
///
/// - `device_id`: "default" (システムのデフォルトデバイス)
/// - `sample_rate`: 16000 Hz (16kHz - 各バックエンドの想定値)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

/// セッション設定
///
/// 動作モードと接続監視に関する設定。
///
/// # デフォルト値
///
/// - `mode`: "auto_resilient" (自動フォールバック)
/// - `connect_timeout_seconds`: 10 秒
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

/// クラウドバックエンド設定
///
/// ストリーミング文字起こしAPIへの接続に関する設定。
///
/// # デフォルト値
///
/// - `api_key`: "" (未設定。環境変数 `GEMINI_API_KEY` にフォールバック)
/// - `model`: "gemini-2.5-flash-native-audio-preview-09-2025"
/// - `endpoint`: Gemini Live API の WebSocket エンドポイント
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_cloud_model")]
    pub model: String,
    #[serde(default = "default_cloud_endpoint")]
    pub endpoint: String,
}

impl CloudConfig {
    /// APIキーを解決
    ///
    /// 設定ファイルの値を優先し、空の場合は環境変数 `GEMINI_API_KEY` を参照する。
    /// どちらも未設定なら空文字列を返す。
    pub fn resolve_api_key(&self) -> String {
        if !self.api_key.is_empty() {
            self.api_key.clone()
        } else {
            std::env::var("GEMINI_API_KEY").unwrap_or_default()
        }
    }
}

/// ローカルASRサーバー設定
///
/// # デフォルト値
///
/// - `server_url`: "ws://localhost:9000"
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalServerConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
}

// Default functions
fn default_device_id() -> String {
    "default".to_string()
}

fn default_sample_rate() -> u32 {
    16000 // 16kHz - バックエンド各種の想定サンプルレート
}

fn default_mode() -> Mode {
    Mode::AutoResilient
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

fn default_cloud_model() -> String {
    "gemini-2.5-flash-native-audio-preview-09-2025".to_string()
}

fn default_cloud_endpoint() -> String {
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string()
}

fn default_server_url() -> String {
    "ws://localhost:9000".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            session: SessionConfig::default(),
            cloud: CloudConfig::default(),
            local: LocalServerConfig::default(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            sample_rate: default_sample_rate(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_cloud_model(),
            endpoint: default_cloud_endpoint(),
        }
    }
}

impl Default for LocalServerConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
        }
    }
}

impl Config {
    /// 設定ファイルから読み込み
    ///
    /// TOML形式の設定ファイルをパースしてConfig構造体を生成する。
    ///
    /// # Arguments
    ///
    /// * `path` - 設定ファイルのパス
    ///
    /// # Errors
    ///
    /// ファイルの読み込みまたはパースに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use cc_captioner::config::Config;
    /// let config = Config::from_file("config.toml").unwrap();
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("設定ファイルの読み込みに失敗: {:?}", path.as_ref()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "設定ファイルのパースに失敗")?;
        Ok(config)
    }

    /// デフォルト設定をファイルに書き出し
    ///
    /// デフォルト値を持つ設定ファイルを生成する。
    /// 既存のファイルは上書きされる。
    ///
    /// # Arguments
    ///
    /// * `path` - 出力先のパス
    ///
    /// # Errors
    ///
    /// ファイルの書き込みに失敗した場合にエラーを返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use cc_captioner::config::Config;
    /// Config::write_default("config.toml").unwrap();
    /// ```
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<()> {
        let config = Config::default();
        let content =
            toml::to_string_pretty(&config).with_context(|| "設定のシリアライズに失敗")?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("設定ファイルの書き込みに失敗: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// 設定ファイルがあれば読み込み、なければデフォルトを使用
    ///
    /// 設定ファイルの存在を確認し、存在する場合は読み込み、
    /// 存在しない場合はデフォルト設定を返す。
    ///
    /// # Arguments
    ///
    /// * `path` - 設定ファイルのパス
    ///
    /// # Errors
    ///
    /// ファイルが存在するがパースに失敗した場合にエラーを返す。
    /// ファイルが存在しない場合はエラーにならず、デフォルト設定を返す。
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use cc_captioner::config::Config;
    /// let config = Config::load_or_default("config.toml").unwrap();
    /// ```
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            log::warn!(
                "設定ファイルが見つかりません。デフォルト設定を使用します: {:?}",
                path.as_ref()
            );
            Ok(Config::default())
        }
    }
}

use anyhow::Result;
use cc_captioner::aggregator::PassthroughPostProcessor;
use cc_captioner::audio_input::AudioInput;
use cc_captioner::config::Config;
use cc_captioner::session::{CaptionSession, DefaultBackendFactory};
use cc_captioner::types::SessionUpdate;
use env_logger::Env;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<()> {
    // ロガーを初期化
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    // コマンドライン引数をパース
    let args: Vec<String> = std::env::args().collect();

    // デバイス一覧表示モード
    if args.len() > 1 && args[1] == "--show-interfaces" {
        AudioInput::list_devices()?;
        return Ok(());
    }

    // 設定ファイル生成モード
    if args.len() > 1 && args[1] == "--generate-config" {
        let config_path = if args.len() > 2 {
            &args[2]
        } else {
            "config.toml"
        };
        Config::write_default(config_path)?;
        println!("設定ファイルを生成しました: {}", config_path);
        return Ok(());
    }

    // 設定ファイルのパス
    let config_path = if args.len() > 1 && !args[1].starts_with("--") {
        &args[1]
    } else {
        "config.toml"
    };

    // 設定を読み込み
    let config = Config::load_or_default(config_path)?;

    log::info!("cc-captioner を起動します");
    log::info!(
        "モード: {:?} / 入力デバイス: {}",
        config.session.mode,
        config.audio.device_id
    );

    // Ctrl+C ハンドラを設定
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    ctrlc::set_handler(move || {
        log::info!("停止シグナルを受信しました...");
        running_clone.store(false, Ordering::SeqCst);
    })?;

    // セッションを開始
    let factory = Box::new(DefaultBackendFactory::new(&config));
    let mut session = CaptionSession::start(&config, factory, Box::new(PassthroughPostProcessor))
        .map_err(|err| anyhow::anyhow!("セッションを開始できません: {}", err))?;
    let mut updates = session.subscribe();

    log::info!("キャプションを開始しました (Ctrl+C で停止)");

    // メインループ: セッション更新をJSON形式で1行ずつ出力する
    while running.load(Ordering::SeqCst) {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(update) => {
                        let closed = update == SessionUpdate::Closed;
                        if let Ok(json) = serde_json::to_string(&update) {
                            println!("{}", json);
                        }
                        if closed {
                            log::info!("セッションが終了しました");
                            running.store(false, Ordering::SeqCst);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("出力が追いつかず {} 件の更新を取りこぼしました", skipped);
                    }
                    Err(RecvError::Closed) => {
                        running.store(false, Ordering::SeqCst);
                    }
                }
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_millis(100)) => {
                // タイムアウト: ループを継続して running をチェック
            }
        }
    }

    // クリーンアップ
    log::info!("停止処理を開始します...");
    session.stop().await;

    // 停止処理中に配信された残りの更新を出力する
    while let Ok(update) = updates.try_recv() {
        if let Ok(json) = serde_json::to_string(&update) {
            println!("{}", json);
        }
    }

    log::info!("cc-captioner を終了しました");

    Ok(())
}

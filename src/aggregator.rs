use crate::types::Caption;
use std::time::Instant;

/// TurnComplete確定時のデフォルト信頼度
pub const DEFAULT_CONFIDENCE: f32 = 0.95;

/// 後処理フックの結果
#[derive(Clone, Debug)]
pub struct ProcessedText {
    /// 最終的なキャプション本文
    pub final_text: String,

    /// 訂正内容の説明（訂正がなければNone）
    pub correction_detail: Option<String>,
}

/// キャプション後処理フック
///
/// 辞書置換やマスキングなどの外部コラボレータが実装する。
/// アグリゲータから見て同期・純粋であること。
pub trait CaptionPostProcessor: Send {
    fn process(&self, text: &str) -> ProcessedText;
}

/// 無加工で通すデフォルトの後処理
pub struct PassthroughPostProcessor;

impl CaptionPostProcessor for PassthroughPostProcessor {
    fn process(&self, text: &str) -> ProcessedText {
        ProcessedText {
            final_text: text.to_string(),
            correction_detail: None,
        }
    }
}

/// トランスクリプトアグリゲータ
///
/// アクティブなバックエンドからの部分結果・確定結果を1本の順序付き
/// キャプション列にまとめる。保持する状態は未確定の発話テキスト
/// （保留テキスト）のみ。
///
/// - 部分結果: 保留テキストを差し替え、途中経過として再配信する
/// - 確定結果: 後処理を適用してキャプションを正確に1件発行する
/// - TurnComplete: 保留テキストが残っていればデフォルト信頼度で確定する
/// - 破棄指示（バックエンド切替時）: 保留テキストを発行せずに捨てる
pub struct TranscriptAggregator {
    pending: String,
    next_id: u64,
    started_at: Instant,
    post: Box<dyn CaptionPostProcessor>,
}

impl TranscriptAggregator {
    pub fn new(post: Box<dyn CaptionPostProcessor>) -> Self {
        Self {
            pending: String::new(),
            next_id: 1,
            started_at: Instant::now(),
            post,
        }
    }

    /// 部分結果を反映
    ///
    /// バックエンドは現在の発話の全文を部分結果として送るため、
    /// 保留テキストは連結ではなく差し替えになる。
    ///
    /// # Returns
    /// 購読者へ再配信する途中経過テキスト
    pub fn on_partial(&mut self, text: &str) -> String {
        self.pending = text.to_string();
        self.pending.clone()
    }

    /// 確定結果を反映
    ///
    /// 保留テキストをクリアし、確定テキストに後処理を適用して
    /// キャプションを1件発行する。空白のみのテキストは発行しない。
    pub fn on_final(&mut self, text: &str, confidence: f32) -> Option<Caption> {
        self.pending.clear();
        self.finalize(text, confidence)
    }

    /// 発話区切りを反映
    ///
    /// 保留テキストが（トリム後に）残っていればデフォルト信頼度で
    /// 確定する。残っていなければ何もしない。
    pub fn on_turn_complete(&mut self) -> Option<Caption> {
        let pending = std::mem::take(&mut self.pending);
        self.finalize(&pending, DEFAULT_CONFIDENCE)
    }

    /// 保留テキストを発行せずに破棄
    ///
    /// バックエンド切替時にコントローラから指示される。
    /// 切替元のバックエンドの未確定テキストは信頼できないため失われる。
    ///
    /// # Returns
    /// 破棄したテキストがあったかどうか
    pub fn discard_pending(&mut self) -> bool {
        let had_pending = !self.pending.trim().is_empty();
        if had_pending {
            log::debug!("保留テキストを破棄: {}", self.pending);
        }
        self.pending.clear();
        had_pending
    }

    /// 現在の保留テキスト
    pub fn pending_text(&self) -> &str {
        &self.pending
    }

    fn finalize(&mut self, text: &str, confidence: f32) -> Option<Caption> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }

        let processed = self.post.process(trimmed);
        let corrected = processed.correction_detail.is_some();
        if let Some(detail) = &processed.correction_detail {
            log::debug!("後処理による訂正: {}", detail);
        }

        let caption = Caption::new(
            self.next_id,
            processed.final_text,
            confidence,
            corrected,
            self.started_at,
        );
        self.next_id += 1;
        Some(caption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn aggregator() -> TranscriptAggregator {
        TranscriptAggregator::new(Box::new(PassthroughPostProcessor))
    }

    /// "発言" を "発話" に置き換えるテスト用後処理
    struct ReplacingPostProcessor;

    impl CaptionPostProcessor for ReplacingPostProcessor {
        fn process(&self, text: &str) -> ProcessedText {
            if text.contains("発言") {
                ProcessedText {
                    final_text: text.replace("発言", "発話"),
                    correction_detail: Some("発言 → 発話".to_string()),
                }
            } else {
                ProcessedText {
                    final_text: text.to_string(),
                    correction_detail: None,
                }
            }
        }
    }

    #[test]
    fn test_n_finals_produce_n_unique_captions() {
        let mut agg = aggregator();
        let texts = ["1件目です。", "2件目です。", "3件目です。"];

        let captions: Vec<Caption> = texts
            .iter()
            .filter_map(|t| agg.on_final(t, 0.9))
            .collect();

        assert_eq!(captions.len(), texts.len());
        let ids: HashSet<u64> = captions.iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), texts.len());
    }

    #[test]
    fn test_partial_replaces_pending_text() {
        let mut agg = aggregator();

        assert_eq!(agg.on_partial("会議を"), "会議を");
        assert_eq!(agg.on_partial("会議を開始"), "会議を開始");
        assert_eq!(agg.pending_text(), "会議を開始");
    }

    #[test]
    fn test_discard_pending_emits_nothing() {
        let mut agg = aggregator();

        agg.on_partial("hello");
        assert!(agg.discard_pending());

        // 破棄後のTurnCompleteは何も確定しない
        assert!(agg.on_turn_complete().is_none());
        assert_eq!(agg.pending_text(), "");
    }

    #[test]
    fn test_final_clears_pending() {
        let mut agg = aggregator();

        agg.on_partial("会議を開始");
        let caption = agg.on_final("会議を開始します。", 0.9).unwrap();

        assert_eq!(caption.text, "会議を開始します。");
        assert_eq!(caption.confidence, 0.9);
        assert!(agg.pending_text().is_empty());
        assert!(agg.on_turn_complete().is_none());
    }

    #[test]
    fn test_turn_complete_finalizes_pending_with_default_confidence() {
        let mut agg = aggregator();

        agg.on_partial("  途中までの発話  ");
        let caption = agg.on_turn_complete().unwrap();

        assert_eq!(caption.text, "途中までの発話");
        assert_eq!(caption.confidence, DEFAULT_CONFIDENCE);
    }

    #[test]
    fn test_turn_complete_without_pending_is_noop() {
        let mut agg = aggregator();
        assert!(agg.on_turn_complete().is_none());

        agg.on_partial("   ");
        assert!(agg.on_turn_complete().is_none());
    }

    #[test]
    fn test_empty_final_is_skipped_and_consumes_no_id() {
        let mut agg = aggregator();

        assert!(agg.on_final("   ", 0.9).is_none());
        let caption = agg.on_final("本文あり。", 0.9).unwrap();
        assert_eq!(caption.id, 1);
    }

    #[test]
    fn test_post_processor_marks_corrections() {
        let mut agg = TranscriptAggregator::new(Box::new(ReplacingPostProcessor));

        let corrected = agg.on_final("次の発言に移ります。", 0.9).unwrap();
        assert_eq!(corrected.text, "次の発話に移ります。");
        assert!(corrected.corrected);

        let plain = agg.on_final("以上です。", 0.9).unwrap();
        assert!(!plain.corrected);
    }

    #[test]
    fn test_caption_ids_and_timestamps_are_monotonic() {
        let mut agg = aggregator();

        let first = agg.on_final("最初の文。", 0.9).unwrap();
        let second = agg.on_final("次の文。", 0.9).unwrap();

        assert!(second.id > first.id);
        assert!(second.timestamp_seconds >= first.timestamp_seconds);
    }
}

use crate::types::AudioFrame;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// バックエンドごとの音声フレームのエンコード形式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    /// リトルエンディアン16ビットPCMの生バイト列（ローカルサーバー・オンデバイス用）
    Pcm16Le,

    /// PCM16をbase64化してMIME記述子付きJSONで包んだもの（クラウド用）
    Base64Json,
}

/// f32サンプル1つを16ビットPCMに変換
///
/// [-1.0, 1.0] にクランプした後、負の値は32768倍、非負の値は32767倍して
/// 四捨五入する。この非対称なスケーリングは既存バックエンドとの
/// ビット互換のために維持する必要がある。
///
/// # Examples
///
/// ```
/// # use cc_captioner::frame_encoder::sample_to_i16;
/// assert_eq!(sample_to_i16(-1.0), -32768);
/// assert_eq!(sample_to_i16(0.0), 0);
/// assert_eq!(sample_to_i16(0.5), 16384);
/// assert_eq!(sample_to_i16(1.0), 32767);
/// ```
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    if clamped < 0.0 {
        (clamped * 32768.0).round() as i16
    } else {
        (clamped * 32767.0).round() as i16
    }
}

/// f32サンプル列をリトルエンディアンPCM16バイト列に変換
pub fn pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    bytes
}

/// base64エンベロープ
///
/// クラウドバックエンドのトランスポートエンコーディング。
/// PCM16バイト列をbase64文字列とMIME記述子の組で包む。
///
/// # JSON例
///
/// ```json
/// {"data": "AAD/fw==", "mimeType": "audio/pcm;rate=16000"}
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PcmEnvelope {
    /// PCM16バイト列のbase64表現
    pub data: String,

    /// MIME記述子（サンプルレート付き）
    pub mime_type: String,
}

impl PcmEnvelope {
    /// サンプル列からエンベロープを生成
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            data: BASE64.encode(pcm16_bytes(samples)),
            mime_type: format!("audio/pcm;rate={}", sample_rate),
        }
    }
}

/// フレームを指定形式のバイト列にエンコード
///
/// 決定的な純粋関数。`Pcm16Le` は生PCMバイト列、`Base64Json` は
/// エンベロープのJSONバイト列を返す。
pub fn encode(frame: &AudioFrame, format: FrameFormat) -> Vec<u8> {
    match format {
        FrameFormat::Pcm16Le => pcm16_bytes(&frame.samples),
        FrameFormat::Base64Json => {
            let envelope = PcmEnvelope::from_samples(&frame.samples, frame.sample_rate);
            match serde_json::to_vec(&envelope) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("音声エンベロープのシリアライズに失敗: {}", e);
                    Vec::new()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asymmetric_scaling() {
        let samples = [-1.0f32, 0.0, 0.5, 1.0];
        let converted: Vec<i16> = samples.iter().map(|&s| sample_to_i16(s)).collect();
        assert_eq!(converted, vec![-32768, 0, 16384, 32767]);
    }

    #[test]
    fn test_out_of_range_samples_are_clamped() {
        assert_eq!(sample_to_i16(1.5), 32767);
        assert_eq!(sample_to_i16(-2.0), -32768);
    }

    #[test]
    fn test_pcm16_little_endian_layout() {
        let bytes = pcm16_bytes(&[1.0, -1.0]);
        assert_eq!(bytes, vec![0xFF, 0x7F, 0x00, 0x80]);
    }

    #[test]
    fn test_envelope_mime_and_payload() {
        let samples = [0.0f32, 0.25, -0.25];
        let envelope = PcmEnvelope::from_samples(&samples, 16000);

        assert_eq!(envelope.mime_type, "audio/pcm;rate=16000");
        let decoded = BASE64.decode(&envelope.data).unwrap();
        assert_eq!(decoded, pcm16_bytes(&samples));
    }

    #[test]
    fn test_envelope_json_uses_camel_case() {
        let envelope = PcmEnvelope::from_samples(&[0.0], 16000);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#""mimeType":"audio/pcm;rate=16000""#));
    }

    #[test]
    fn test_encode_dispatch() {
        let frame = AudioFrame {
            samples: vec![0.0, 0.5],
            sample_rate: 16000,
        };

        let raw = encode(&frame, FrameFormat::Pcm16Le);
        assert_eq!(raw.len(), 4);

        let wrapped = encode(&frame, FrameFormat::Base64Json);
        let envelope: PcmEnvelope = serde_json::from_slice(&wrapped).unwrap();
        assert_eq!(BASE64.decode(&envelope.data).unwrap(), raw);
    }
}

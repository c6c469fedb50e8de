//! Speech synthesis engines.

use crate::error::VoiceError;
use crate::http::{self, MiniMaxBaseResp};
use crate::subprocess;
use async_trait::async_trait;
use base64::Engine as _;
use dh_engine::{joined_text, Engine, EngineConfig, EngineError, EngineKind, TtsEngine, TtsOptions};
use dh_types::{AudioFormat, AudioMessage, TextMessage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Maximum text input size for synthesis (64 KiB).
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

pub const MINIMAX_T2A_URL: &str = "https://api.minimax.chat/v1/t2a_v2";

fn default_minimax_model() -> String {
    "speech-01".to_string()
}

fn default_minimax_voice() -> String {
    "female-general-24".to_string()
}

fn default_sample_rate() -> u32 {
    24000
}

fn default_speed() -> f32 {
    1.0
}

fn default_tts_timeout_secs() -> u64 {
    30
}

fn check_length(text: &str) -> Result<(), EngineError> {
    if text.len() > MAX_TTS_INPUT_BYTES {
        return Err(VoiceError::InputTooLarge {
            what: "text",
            size: text.len(),
            limit: MAX_TTS_INPUT_BYTES,
        }
        .into());
    }
    Ok(())
}

fn check_speed(speed: f32) -> Result<(), EngineError> {
    if !(0.1..=10.0).contains(&speed) {
        return Err(EngineError::InvalidInput(
            "speed must be between 0.1 and 10.0".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct MiniMaxTtsSettings {
    pub api_key: String,
    pub group_id: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_minimax_model")]
    pub model: String,
    #[serde(default = "default_minimax_voice")]
    pub voice_id: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_speed")]
    pub speed: f32,
    #[serde(default = "default_tts_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize)]
struct T2aRequest<'a> {
    model: &'a str,
    text: &'a str,
    stream: bool,
    voice_setting: VoiceSetting<'a>,
    audio_setting: AudioSetting,
}

#[derive(Debug, Serialize)]
struct VoiceSetting<'a> {
    voice_id: &'a str,
    speed: f32,
    vol: f32,
    pitch: i32,
}

#[derive(Debug, Serialize)]
struct AudioSetting {
    sample_rate: u32,
    format: &'static str,
    channel: u8,
}

#[derive(Debug, Default, Deserialize)]
struct T2aResponse {
    #[serde(default)]
    data: Option<T2aData>,
    /// Older deployments return base64 audio at the top level.
    #[serde(default)]
    audio_data: Option<String>,
    #[serde(default)]
    base_resp: Option<MiniMaxBaseResp>,
}

#[derive(Debug, Default, Deserialize)]
struct T2aData {
    /// Hex-encoded MP3.
    #[serde(default)]
    audio: Option<String>,
}

/// MiniMax T2A v2 synthesis. Returns MP3.
pub struct MiniMaxTts {
    name: String,
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
    settings: MiniMaxTtsSettings,
}

impl MiniMaxTts {
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let settings: MiniMaxTtsSettings = config.settings()?;
        check_speed(settings.speed)?;
        let timeout = Duration::from_secs(settings.timeout_secs.max(1));
        let base = settings.endpoint.as_deref().unwrap_or(MINIMAX_T2A_URL);
        Ok(Self {
            name: config.name.clone(),
            endpoint: format!("{base}?GroupId={}", settings.group_id),
            timeout,
            client: http::client(timeout)?,
            settings,
        })
    }
}

#[async_trait]
impl Engine for MiniMaxTts {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Tts
    }
}

#[async_trait]
impl TtsEngine for MiniMaxTts {
    async fn run(
        &self,
        input: &[TextMessage],
        options: &TtsOptions,
    ) -> Result<Option<AudioMessage>, EngineError> {
        let Some(text) = joined_text(input) else {
            return Ok(None);
        };
        check_length(&text)?;
        let speed = options.speed.unwrap_or(self.settings.speed);
        check_speed(speed)?;

        let body = T2aRequest {
            model: &self.settings.model,
            text: &text,
            stream: false,
            voice_setting: VoiceSetting {
                voice_id: options.voice_id.as_deref().unwrap_or(self.default_voice()),
                speed,
                vol: 1.0,
                pitch: 0,
            },
            audio_setting: AudioSetting {
                sample_rate: self.settings.sample_rate,
                format: "mp3",
                channel: 1,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::transport_error(e, self.timeout))?;
        let response = http::ensure_success(response).await?;
        let parsed: T2aResponse = http::read_json(response).await?;
        let data = decode_t2a(parsed)?;

        Ok(Some(
            AudioMessage::new(data, AudioFormat::Mp3, self.settings.sample_rate, 2).with_desc(text),
        ))
    }

    fn default_voice(&self) -> &str {
        &self.settings.voice_id
    }

    fn cache_params(&self, options: &TtsOptions) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("engine".into(), self.name.clone());
        params.insert("model".into(), self.settings.model.clone());
        params.insert("sample_rate".into(), self.settings.sample_rate.to_string());
        params.insert(
            "speed".into(),
            options.speed.unwrap_or(self.settings.speed).to_string(),
        );
        params
    }
}

fn decode_t2a(response: T2aResponse) -> Result<Vec<u8>, EngineError> {
    if let Some(base) = response.base_resp {
        base.into_result()?;
    }
    if let Some(hex_audio) = response.data.and_then(|d| d.audio).filter(|a| !a.is_empty()) {
        return hex::decode(hex_audio)
            .map_err(|e| EngineError::MalformedResponse(format!("audio is not valid hex: {e}")));
    }
    if let Some(b64) = response.audio_data.filter(|a| !a.is_empty()) {
        return base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| EngineError::MalformedResponse(format!("audio is not valid base64: {e}")));
    }
    Err(EngineError::MalformedResponse(
        "response carries no audio".to_string(),
    ))
}

fn default_piper_binary() -> PathBuf {
    PathBuf::from("piper")
}

fn default_voices_dir() -> PathBuf {
    PathBuf::from("voices")
}

fn default_piper_sample_rate() -> u32 {
    22050
}

fn default_piper_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct PiperSettings {
    /// Default voice: a model file stem inside `voices_dir`, or an absolute
    /// path to an `.onnx` model.
    pub voice: String,
    #[serde(default = "default_voices_dir")]
    pub voices_dir: PathBuf,
    #[serde(default = "default_piper_binary")]
    pub binary: PathBuf,
    #[serde(default)]
    pub speaker: Option<u32>,
    #[serde(default = "default_piper_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_piper_timeout_secs")]
    pub timeout_secs: u64,
}

/// Local synthesis through the Piper binary. Returns WAV.
pub struct PiperTts {
    name: String,
    timeout: Duration,
    settings: PiperSettings,
}

impl PiperTts {
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let settings: PiperSettings = config.settings()?;
        Ok(Self {
            name: config.name.clone(),
            timeout: Duration::from_secs(settings.timeout_secs.max(1)),
            settings,
        })
    }

    /// Resolves a voice id to its model file. Only the configured default
    /// may be an absolute path; request voices are bare stems inside
    /// `voices_dir`.
    fn model_path(&self, voice: &str) -> Result<PathBuf, EngineError> {
        let path = Path::new(voice);
        if voice == self.settings.voice && path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        if voice.is_empty()
            || voice.contains(['/', '\\'])
            || voice.contains("..")
            || path.is_absolute()
        {
            return Err(EngineError::InvalidInput(format!("invalid voice id: {voice}")));
        }
        Ok(self.settings.voices_dir.join(format!("{voice}.onnx")))
    }
}

#[async_trait]
impl Engine for PiperTts {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Tts
    }
}

#[async_trait]
impl TtsEngine for PiperTts {
    async fn run(
        &self,
        input: &[TextMessage],
        options: &TtsOptions,
    ) -> Result<Option<AudioMessage>, EngineError> {
        let Some(text) = joined_text(input) else {
            return Ok(None);
        };
        check_length(&text)?;
        let speed = options.speed.unwrap_or(1.0);
        check_speed(speed)?;

        let voice = options.voice_id.as_deref().unwrap_or(self.default_voice());
        let model_path = self.model_path(voice)?;
        if !tokio::fs::try_exists(&model_path).await.unwrap_or(false) {
            if voice == self.default_voice() {
                return Err(VoiceError::NotFound(model_path).into());
            }
            return Err(EngineError::InvalidInput(format!("unknown voice: {voice}")));
        }

        let mut command = Command::new(&self.settings.binary);
        command
            .arg("--model")
            .arg(&model_path)
            .arg("--output_raw")
            // Length scale is the inverse of speed.
            .arg("--length_scale")
            .arg((1.0 / speed).to_string());
        if let Some(speaker) = self.settings.speaker {
            command.arg("--speaker").arg(speaker.to_string());
        }

        let pcm = subprocess::run_with_stdin(command, text.clone().into_bytes(), self.timeout).await?;
        if pcm.is_empty() {
            return Ok(None);
        }
        let wav = wav_from_pcm(&pcm, self.settings.sample_rate, 1, 16);
        Ok(Some(
            AudioMessage::new(wav, AudioFormat::Wav, self.settings.sample_rate, 2).with_desc(text),
        ))
    }

    fn default_voice(&self) -> &str {
        &self.settings.voice
    }

    fn cache_params(&self, options: &TtsOptions) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("engine".into(), self.name.clone());
        params.insert("speed".into(), options.speed.unwrap_or(1.0).to_string());
        if let Some(speaker) = self.settings.speaker {
            params.insert("speaker".into(), speaker.to_string());
        }
        params
    }
}

/// Wraps little-endian PCM samples in a canonical 44-byte WAV header.
pub fn wav_from_pcm(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * u32::from(block_align);
    let data_len = pcm.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_is_detectable() {
        let wav = wav_from_pcm(&[0u8; 100], 22050, 1, 16);
        assert_eq!(wav.len(), 144);
        assert_eq!(AudioFormat::detect(&wav), Some(AudioFormat::Wav));
        assert_eq!(&wav[40..44], &100u32.to_le_bytes());
    }

    #[test]
    fn decodes_hex_audio() {
        let response: T2aResponse = serde_json::from_str(
            r#"{"data":{"audio":"49443303","status":2},"base_resp":{"status_code":0,"status_msg":"success"}}"#,
        )
        .unwrap();
        assert_eq!(decode_t2a(response).unwrap(), b"ID3\x03");
    }

    #[test]
    fn decodes_legacy_base64_audio() {
        let response: T2aResponse = serde_json::from_str(r#"{"audio_data":"SUQz"}"#).unwrap();
        assert_eq!(decode_t2a(response).unwrap(), b"ID3");
    }

    #[test]
    fn provider_error_wins_over_missing_audio() {
        let response: T2aResponse = serde_json::from_str(
            r#"{"base_resp":{"status_code":1004,"status_msg":"authorization failed"}}"#,
        )
        .unwrap();
        assert!(matches!(decode_t2a(response), Err(EngineError::Auth(_))));
    }

    #[test]
    fn cache_params_track_speed() {
        let config = EngineConfig::new("minimax")
            .with_param("api_key", "k")
            .with_param("group_id", "g");
        let tts = MiniMaxTts::from_config(&config).unwrap();
        let normal = tts.cache_params(&TtsOptions::default());
        let fast = tts.cache_params(&TtsOptions {
            voice_id: None,
            speed: Some(1.5),
        });
        assert_ne!(normal, fast);
        assert_eq!(normal.get("engine").map(String::as_str), Some("minimax"));
        assert_eq!(tts.default_voice(), "female-general-24");
    }

    #[tokio::test]
    async fn piper_missing_model_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new("piper")
            .with_param("voice", "zh_CN-huayan-medium")
            .with_param("voices_dir", dir.path().to_string_lossy().to_string());
        let tts = PiperTts::from_config(&config).unwrap();
        let err = tts
            .run(&[TextMessage::new("你好")], &TtsOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(ref msg) if msg.contains("zh_CN-huayan-medium.onnx")));
    }

    fn piper_in(dir: &Path) -> PiperTts {
        let config = EngineConfig::new("piper")
            .with_param("voice", "zh_CN-huayan-medium")
            .with_param("voices_dir", dir.to_string_lossy().to_string());
        PiperTts::from_config(&config).unwrap()
    }

    async fn speak_as(tts: &PiperTts, voice: &str) -> EngineError {
        let options = TtsOptions {
            voice_id: Some(voice.to_string()),
            speed: None,
        };
        tts.run(&[TextMessage::new("你好")], &options)
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn unknown_request_voice_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let tts = piper_in(dir.path());

        let err = speak_as(&tts, "warm-typo").await;

        assert!(matches!(err, EngineError::InvalidInput(ref msg) if msg == "unknown voice: warm-typo"));
        assert!(!err.is_configuration());
        assert!(!err.to_string().contains(&*dir.path().to_string_lossy()));
    }

    #[tokio::test]
    async fn voice_ids_cannot_leave_voices_dir() {
        let dir = tempfile::tempdir().unwrap();
        let voices = dir.path().join("voices");
        std::fs::create_dir(&voices).unwrap();
        std::fs::write(dir.path().join("secret.onnx"), b"model").unwrap();
        let tts = piper_in(&voices);

        for voice in ["../secret", "sub/voice", "sub\\voice", ".."] {
            let err = speak_as(&tts, voice).await;
            assert!(matches!(err, EngineError::InvalidInput(_)), "{voice}: {err}");
        }
        let absolute = dir.path().join("secret").to_string_lossy().to_string();
        let err = speak_as(&tts, &absolute).await;
        assert!(matches!(err, EngineError::InvalidInput(_)), "{err}");
    }

    #[test]
    fn absolute_default_voice_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("custom.onnx").to_string_lossy().to_string();
        let config = EngineConfig::new("piper").with_param("voice", model.clone());
        let tts = PiperTts::from_config(&config).unwrap();

        assert_eq!(tts.model_path(&model).unwrap(), PathBuf::from(&model));
    }

    #[tokio::test]
    async fn nothing_to_say_is_none() {
        let config = EngineConfig::new("piper").with_param("voice", "v");
        let tts = PiperTts::from_config(&config).unwrap();
        let out = tts
            .run(&[TextMessage::pending()], &TtsOptions::default())
            .await
            .unwrap();
        assert!(out.is_none());
    }
}

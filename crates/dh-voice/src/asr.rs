//! Speech recognition engines.

use crate::error::VoiceError;
use crate::http;
use crate::subprocess;
use async_trait::async_trait;
use dh_engine::{first_input, AsrEngine, AsrOptions, Engine, EngineConfig, EngineError, EngineKind};
use dh_types::{AudioFormat, AudioMessage, TextMessage};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

/// Maximum audio input size for recognition (10 MiB).
const MAX_ASR_INPUT_BYTES: usize = 10 * 1024 * 1024;

pub const DEEPGRAM_LISTEN_URL: &str = "https://api.deepgram.com/v1/listen";

fn check_audio(audio: &AudioMessage) -> Result<(), EngineError> {
    if audio.is_empty() {
        return Err(EngineError::InvalidInput("audio payload is empty".into()));
    }
    if audio.data.len() > MAX_ASR_INPUT_BYTES {
        return Err(VoiceError::InputTooLarge {
            what: "audio",
            size: audio.data.len(),
            limit: MAX_ASR_INPUT_BYTES,
        }
        .into());
    }
    Ok(())
}

fn non_blank(text: &str) -> Option<TextMessage> {
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(TextMessage::new(text).with_desc("user"))
    }
}

fn default_deepgram_model() -> String {
    "nova-2".to_string()
}

fn default_language() -> String {
    "zh-CN".to_string()
}

fn default_true() -> bool {
    true
}

fn default_asr_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeepgramSettings {
    pub api_key: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_deepgram_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_true")]
    pub smart_format: bool,
    #[serde(default = "default_asr_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ListenResponse {
    results: ListenResults,
}

#[derive(Debug, Deserialize)]
struct ListenResults {
    #[serde(default)]
    channels: Vec<ListenChannel>,
}

#[derive(Debug, Deserialize)]
struct ListenChannel {
    #[serde(default)]
    alternatives: Vec<ListenAlternative>,
}

#[derive(Debug, Deserialize)]
struct ListenAlternative {
    #[serde(default)]
    transcript: String,
}

/// Deepgram pre-recorded transcription over REST.
pub struct DeepgramAsr {
    name: String,
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
    settings: DeepgramSettings,
}

impl DeepgramAsr {
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let settings: DeepgramSettings = config.settings()?;
        let timeout = Duration::from_secs(settings.timeout_secs.max(1));
        Ok(Self {
            name: config.name.clone(),
            endpoint: settings
                .endpoint
                .clone()
                .unwrap_or_else(|| DEEPGRAM_LISTEN_URL.to_string()),
            timeout,
            client: http::client(timeout)?,
            settings,
        })
    }
}

#[async_trait]
impl Engine for DeepgramAsr {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Asr
    }
}

#[async_trait]
impl AsrEngine for DeepgramAsr {
    async fn run(
        &self,
        input: &[AudioMessage],
        options: &AsrOptions,
    ) -> Result<Option<TextMessage>, EngineError> {
        let Some(audio) = first_input(&self.name, input) else {
            return Err(EngineError::InvalidInput("no audio supplied".into()));
        };
        check_audio(audio)?;

        let language = options.language.as_deref().unwrap_or(&self.settings.language);
        let smart_format = self.settings.smart_format.to_string();
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[
                ("model", self.settings.model.as_str()),
                ("language", language),
                ("smart_format", smart_format.as_str()),
                ("punctuate", "true"),
            ])
            .header("Authorization", format!("Token {}", self.settings.api_key))
            .header("Content-Type", audio.format.mime_type())
            .body(audio.data.clone())
            .send()
            .await
            .map_err(|e| http::transport_error(e, self.timeout))?;
        let response = http::ensure_success(response).await?;
        let parsed: ListenResponse = http::read_json(response).await?;
        Ok(transcript_of(parsed).and_then(|t| non_blank(&t)))
    }
}

fn transcript_of(response: ListenResponse) -> Option<String> {
    response
        .results
        .channels
        .into_iter()
        .next()?
        .alternatives
        .into_iter()
        .next()
        .map(|a| a.transcript)
}

fn default_whisper_binary() -> PathBuf {
    PathBuf::from("whisper-cli")
}

fn default_whisper_language() -> String {
    "auto".to_string()
}

fn default_whisper_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhisperSettings {
    /// Path to a GGML model file.
    pub model_path: PathBuf,
    #[serde(default = "default_whisper_binary")]
    pub binary: PathBuf,
    #[serde(default = "default_whisper_language")]
    pub language: String,
    #[serde(default = "default_whisper_timeout_secs")]
    pub timeout_secs: u64,
}

/// Local recognition through a whisper.cpp binary. Accepts WAV input only.
pub struct WhisperCliAsr {
    name: String,
    timeout: Duration,
    settings: WhisperSettings,
}

impl WhisperCliAsr {
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let settings: WhisperSettings = config.settings()?;
        Ok(Self {
            name: config.name.clone(),
            timeout: Duration::from_secs(settings.timeout_secs.max(1)),
            settings,
        })
    }
}

#[async_trait]
impl Engine for WhisperCliAsr {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Asr
    }
}

#[async_trait]
impl AsrEngine for WhisperCliAsr {
    async fn run(
        &self,
        input: &[AudioMessage],
        options: &AsrOptions,
    ) -> Result<Option<TextMessage>, EngineError> {
        let Some(audio) = first_input(&self.name, input) else {
            return Err(EngineError::InvalidInput("no audio supplied".into()));
        };
        check_audio(audio)?;
        if audio.format != AudioFormat::Wav {
            return Err(EngineError::InvalidInput(format!(
                "{} accepts wav audio, got {}",
                self.name, audio.format
            )));
        }
        if !tokio::fs::try_exists(&self.settings.model_path)
            .await
            .unwrap_or(false)
        {
            return Err(VoiceError::NotFound(self.settings.model_path.clone()).into());
        }

        let language = options.language.as_deref().unwrap_or(&self.settings.language);
        // whisper.cpp wants a bare language code.
        let language = language.split(['-', '_']).next().unwrap_or(language);

        let mut command = Command::new(&self.settings.binary);
        command
            .arg("-m")
            .arg(&self.settings.model_path)
            .arg("-l")
            .arg(language)
            .arg("--no-timestamps")
            .arg("-f")
            .arg("-");

        let stdout = subprocess::run_with_stdin(command, audio.data.clone(), self.timeout).await?;
        Ok(non_blank(&String::from_utf8_lossy(&stdout)))
    }
}

//! Shared message protocol for the digital-human workspace.
//!
//! Every stage of the conversation pipeline exchanges immutable values from
//! this crate: recognised or generated text travels as [`TextMessage`],
//! captured or synthesized audio as [`AudioMessage`]. Each message receives a
//! fresh id at construction; a stage never mutates its input, it produces a
//! new message.
//!
//! No crate in the workspace depends on anything *except* `dh-types` for
//! cross-cutting type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Container format of an audio payload.
///
/// The set is closed: anything else is rejected when a payload is decoded at
/// the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Wav,
    Webm,
    Ogg,
}

impl AudioFormat {
    /// All supported formats, in declaration order.
    pub const ALL: [AudioFormat; 4] = [Self::Mp3, Self::Wav, Self::Webm, Self::Ogg];

    /// Returns the lowercase wire label for this format.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
            Self::Webm => "webm",
            Self::Ogg => "ogg",
        }
    }

    /// Returns the MIME type used when uploading this format to a provider.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Wav => "audio/wav",
            Self::Webm => "audio/webm",
            Self::Ogg => "audio/ogg",
        }
    }

    /// Sniffs the container format from the leading bytes of a payload.
    ///
    /// Returns `None` when the header matches none of the supported formats.
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }
        if &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE" {
            return Some(Self::Wav);
        }
        if &data[0..3] == b"ID3" || (data[0] == 0xFF && (data[1] & 0xE0) == 0xE0) {
            return Some(Self::Mp3);
        }
        if &data[0..4] == b"OggS" {
            return Some(Self::Ogg);
        }
        if data[0..4] == [0x1A, 0x45, 0xDF, 0xA3] {
            return Some(Self::Webm);
        }
        None
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an audio format label is not one of the supported formats.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported audio format: {0} (expected one of mp3, wav, webm, ogg)")]
pub struct UnsupportedFormat(pub String);

impl FromStr for AudioFormat {
    type Err = UnsupportedFormat;

    /// Accepts plain labels (`"wav"`) as well as MIME types (`"audio/webm"`,
    /// `"audio/webm;codecs=opus"`) as sent by browsers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        let label = normalized
            .strip_prefix("audio/")
            .unwrap_or(&normalized)
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        match label {
            "mp3" | "mpeg" => Ok(Self::Mp3),
            "wav" | "wave" | "x-wav" => Ok(Self::Wav),
            "webm" => Ok(Self::Webm),
            "ogg" => Ok(Self::Ogg),
            _ => Err(UnsupportedFormat(s.to_string())),
        }
    }
}

/// Opaque, never-reused message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An audio payload flowing between stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioMessage {
    id: MessageId,
    /// Raw bytes in the container given by `format`.
    pub data: Vec<u8>,
    pub format: AudioFormat,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bytes per sample (2 = 16-bit).
    pub sample_width: u16,
    /// Free-text annotation, e.g. the source text of synthesized speech.
    pub desc: Option<String>,
}

impl AudioMessage {
    pub fn new(data: Vec<u8>, format: AudioFormat, sample_rate: u32, sample_width: u16) -> Self {
        Self {
            id: MessageId::generate(),
            data,
            format,
            sample_rate,
            sample_width,
            desc: None,
        }
    }

    /// Attaches a description, returning the message.
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A text payload flowing between stages.
///
/// `data == None` means "not produced yet", which is distinct from an empty
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    id: MessageId,
    pub data: Option<String>,
    /// Role or origin tag ("user", "assistant", provider name).
    pub desc: Option<String>,
}

impl TextMessage {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            data: Some(data.into()),
            desc: None,
        }
    }

    /// A message whose text has not been produced.
    pub fn pending() -> Self {
        Self {
            id: MessageId::generate(),
            data: None,
            desc: None,
        }
    }

    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Returns the text when it is present and not blank.
    pub fn text(&self) -> Option<&str> {
        self.data.as_deref().filter(|t| !t.trim().is_empty())
    }
}

impl From<&str> for TextMessage {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TextMessage {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Speaker of one turn in a conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One role-tagged turn, replayed verbatim to language models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Result of an agent run: the reply text plus structured run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub message: TextMessage,
    pub run_id: Option<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AgentReply {
    pub fn text(&self) -> Option<&str> {
        self.message.text()
    }
}

/// Audio produced by the synthesis stage, tagged with its cache provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    pub audio: AudioMessage,
    /// `true` when the bytes were served from the content-addressed cache.
    pub from_cache: bool,
}

//! Buffered recognition for audio streamed over a persistent connection.

use async_trait::async_trait;
use dh_engine::{retry, AsrEngine, AsrOptions, EngineError, RetryPolicy};
use dh_types::{AudioFormat, AudioMessage, TextMessage};
use std::sync::Arc;

/// Upper bound on audio buffered for one utterance.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// A streaming recognition session fed chunk by chunk.
#[async_trait]
pub trait TranscriptionSession: Send + Sync {
    /// Appends a chunk of encoded audio.
    async fn push(&mut self, chunk: &[u8]) -> Result<(), EngineError>;

    /// Ends the current utterance and returns its transcript, if any.
    /// The session stays usable for the next utterance.
    async fn finish(&mut self) -> Result<Option<TextMessage>, EngineError>;

    /// Releases the session. Idempotent.
    async fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Collects chunks and recognises them in one batch on [`finish`].
///
/// [`finish`]: TranscriptionSession::finish
pub struct BufferedTranscription {
    engine: Arc<dyn AsrEngine>,
    retry: RetryPolicy,
    options: AsrOptions,
    format: AudioFormat,
    sample_rate: u32,
    sample_width: u16,
    buffer: Vec<u8>,
    max_bytes: usize,
    closed: bool,
}

impl BufferedTranscription {
    pub fn new(
        engine: Arc<dyn AsrEngine>,
        retry: RetryPolicy,
        options: AsrOptions,
        format: AudioFormat,
        sample_rate: u32,
        sample_width: u16,
    ) -> Self {
        Self {
            engine,
            retry,
            options,
            format,
            sample_rate,
            sample_width,
            buffer: Vec::new(),
            max_bytes: DEFAULT_MAX_BUFFER_BYTES,
            closed: false,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[async_trait]
impl TranscriptionSession for BufferedTranscription {
    async fn push(&mut self, chunk: &[u8]) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::InvalidInput("transcription session is closed".into()));
        }
        if self.buffer.len() + chunk.len() > self.max_bytes {
            self.buffer.clear();
            return Err(EngineError::InvalidInput(format!(
                "buffered audio exceeds {} bytes",
                self.max_bytes
            )));
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<Option<TextMessage>, EngineError> {
        if self.closed {
            return Err(EngineError::InvalidInput("transcription session is closed".into()));
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let data = std::mem::take(&mut self.buffer);
        // The container header wins over the declared format.
        let format = AudioFormat::detect(&data).unwrap_or(self.format);
        let input = [AudioMessage::new(data, format, self.sample_rate, self.sample_width)];
        tracing::debug!(
            engine = self.engine.name(),
            bytes = input[0].data.len(),
            format = %format,
            "recognising buffered utterance"
        );
        let engine = &self.engine;
        let options = &self.options;
        retry(&self.retry, "asr", || engine.run(&input, options)).await
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.buffer = Vec::new();
            tracing::debug!(engine = self.engine.name(), "transcription session closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

use crate::history::ChatMessage;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model not loaded")]
    ModelNotLoaded,
    #[error("reload failed: {0}")]
    ReloadFailed(String),
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("engine error: {0}")]
    Backend(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Token accounting reported with the last chunk of a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub prefill_tokens_per_s: Option<f64>,
    pub decode_tokens_per_s: Option<f64>,
}

impl Usage {
    /// One-line label shown next to the conversation.
    pub fn label(&self) -> String {
        match (self.prefill_tokens_per_s, self.decode_tokens_per_s) {
            (Some(prefill), Some(decode)) => {
                format!("prefill: {prefill:.1} tok/s, decode: {decode:.1} tok/s")
            }
            _ => format!(
                "prompt: {} tokens, completion: {} tokens",
                self.prompt_tokens, self.completion_tokens
            ),
        }
    }
}

/// One streamed increment of a completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationChunk {
    pub delta: String,
    /// Set on the last content chunk, e.g. `"stop"` or `"length"`.
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl GenerationChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            ..Default::default()
        }
    }

    pub fn finished(delta: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            finish_reason: Some(reason.into()),
            usage: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub include_usage: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            include_usage: true,
        }
    }
}

pub type ChunkStream<'a> = Box<dyn Iterator<Item = EngineResult<GenerationChunk>> + 'a>;

/// Opaque inference backend.
///
/// Not thread-safe: the session controller moves it onto its worker thread
/// and never calls it from anywhere else.
pub trait InferenceEngine: Send {
    fn reload(&mut self, model_path: &Path, model_lib: &str) -> EngineResult<()>;

    /// Drop the conversation state kept by the engine (KV cache).
    fn reset(&mut self) -> EngineResult<()>;

    fn unload(&mut self) -> EngineResult<()>;

    /// Start a streamed completion over the full history.
    ///
    /// Each item is pulled synchronously; pulling the next item is the only
    /// point where the caller can stop a generation.
    fn generate(
        &mut self,
        messages: &[ChatMessage],
        options: GenerateOptions,
    ) -> EngineResult<ChunkStream<'_>>;
}

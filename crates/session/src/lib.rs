mod controller;
mod engine;
mod history;
mod postprocess;

pub use controller::{
    ModelTarget, SessionController, SessionSnapshot, SessionState, SummaryCallback,
    DIAGNOSTIC_HEADER, IMAGE_READY_REPORT, SUMMARY_INSTRUCTION, SUMMARY_PLACEHOLDER,
};
pub use engine::{
    ChunkStream, EngineError, EngineResult, GenerateOptions, GenerationChunk, InferenceEngine,
    Usage,
};
pub use history::{ChatMessage, ContentPart, MessageContent, MessageData, Role};
pub use postprocess::{
    dedupe_repeated_tail, detect_repeat_tail, split_sentences, TRUNCATION_NOTICE,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("storage error: {0}")]
    Storage(#[from] mlchat_storage::StorageError),
    #[error("generation was interrupted")]
    Interrupted,
    #[error("summary generation produced no text")]
    EmptySummary,
}

pub type Result<T> = std::result::Result<T, SessionError>;

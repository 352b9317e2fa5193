//! OpenAI chat-completions wire protocol.

mod types;

pub use types::{
    AssistantMessage, ChatChoice, ChatChunkChoice, ChatCompletionChunk, ChatCompletionRequest,
    ChatCompletionResponse, ChatDelta, ChatMessage, CompletionFrame, ContentPart, ErrorBody,
    ErrorDetail, ImageUrl, MessageContent, ModelInfo, ModelList, Role, Usage,
};

/// The literal SSE end-of-stream sentinel.
pub const SSE_DONE: &str = "[DONE]";

//! Line-delimited JSON events emitted by the agent on stdout.

use serde::Deserialize;
use serde_json::Value;

// ============================================================================
// Top-level events
// ============================================================================

/// One line of the agent's streaming output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Raw model stream event, wrapped.
    StreamEvent { event: StreamEventBody },
    /// Final outcome of the invocation.
    Result(ResultEvent),
    /// Session/init metadata.
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    /// Complete assistant message snapshot.
    Assistant {
        #[serde(default)]
        message: Value,
    },
    /// Unknown event type (forward-compatible).
    #[serde(other)]
    Unknown,
}

impl AgentEvent {
    /// Parse one line. Blank or malformed lines yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str(line) {
            Ok(event) => Some(event),
            Err(e) => {
                log::debug!("skipping malformed agent event ({}): {}", e, line);
                None
            }
        }
    }
}

/// Payload of a `result` event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

// ============================================================================
// Wrapped model stream events
// ============================================================================

/// Inner event of a `stream_event` line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventBody {
    MessageStart {
        #[serde(default)]
        message: StreamMessage,
    },
    MessageDelta {
        #[serde(default)]
        delta: MessageDelta,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    ContentBlockDelta {
        #[serde(default)]
        index: usize,
        delta: ContentDelta,
    },
    #[serde(other)]
    Unknown,
}

/// Message header carried by `message_start`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StreamMessage {
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Body of `message_delta`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// Token counters as reported by the model stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Delta payload of `content_block_delta`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    #[serde(other)]
    Unknown,
}

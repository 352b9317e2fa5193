//! Translation of the agent's event stream into chat-completion results.
//!
//! [`StreamTranslator`] is a synchronous state machine fed one
//! [`AgentEvent`] at a time. It accumulates the assistant text, token usage,
//! the stop reason and the agent session id, and reports what a streaming
//! caller should emit immediately. The non-streaming path feeds every event
//! and then calls [`StreamTranslator::finish`].

mod lines;

pub use lines::EventReader;

use crate::agent::{AgentEvent, ContentDelta, ResultEvent, StreamEventBody};
use crate::openai::Usage;

/// Stop reason of a model turn that hands control to a tool. The agent
/// keeps going afterwards, so it does not end the response.
const TOOL_USE: &str = "tool_use";

/// Something a streaming caller must forward right away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    /// Text to send as one content delta.
    Content(String),
    /// Totals to send once, after all content so far.
    Usage(Usage),
}

/// Aggregated result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub finish_reason: &'static str,
    pub usage: Option<Usage>,
    pub session_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct StreamTranslator {
    content: String,
    prompt_tokens: u64,
    completion_tokens: u64,
    stop_reason: Option<String>,
    session_id: Option<String>,
    usage_reported: bool,
}

impl StreamTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the state. Returns what must be emitted now, in
    /// order.
    pub fn on_event(&mut self, event: &AgentEvent) -> Vec<Emission> {
        match event {
            AgentEvent::StreamEvent { event } => self.on_stream_event(event),
            AgentEvent::Result(result) => self.on_result(result),
            AgentEvent::System { .. } | AgentEvent::Assistant { .. } | AgentEvent::Unknown => {
                Vec::new()
            }
        }
    }

    fn on_stream_event(&mut self, event: &StreamEventBody) -> Vec<Emission> {
        match event {
            StreamEventBody::MessageStart { message } => {
                self.prompt_tokens += message.usage.input_tokens;
                self.completion_tokens += message.usage.output_tokens;
                Vec::new()
            }
            StreamEventBody::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.completion_tokens = usage.output_tokens;
                }
                let Some(reason) = &delta.stop_reason else {
                    return Vec::new();
                };
                self.stop_reason = Some(reason.clone());
                if reason == TOOL_USE {
                    return Vec::new();
                }
                self.take_usage().map(Emission::Usage).into_iter().collect()
            }
            StreamEventBody::ContentBlockDelta {
                delta: ContentDelta::TextDelta { text },
                ..
            } if !text.is_empty() => {
                self.content.push_str(text);
                vec![Emission::Content(text.clone())]
            }
            StreamEventBody::ContentBlockDelta { .. } | StreamEventBody::Unknown => Vec::new(),
        }
    }

    fn on_result(&mut self, result: &ResultEvent) -> Vec<Emission> {
        if let Some(id) = result.session_id.as_deref().filter(|id| !id.is_empty()) {
            self.session_id = Some(id.to_string());
        }
        let error_text = result
            .result
            .as_deref()
            .map(str::trim)
            .filter(|text| result.is_error && !text.is_empty());
        match error_text {
            Some(text) => vec![Emission::Content(self.annotate_error(text))],
            None => Vec::new(),
        }
    }

    /// Append `[Error: text]` to the content, after a blank line if there
    /// is content already. Returns the appended text.
    pub fn annotate_error(&mut self, text: &str) -> String {
        let separator = if self.content.is_empty() { "" } else { "\n\n" };
        let annotation = format!("{separator}[Error: {text}]");
        self.content.push_str(&annotation);
        annotation
    }

    /// Usage totals, if any token was counted.
    pub fn usage(&self) -> Option<Usage> {
        let usage = Usage::new(self.prompt_tokens, self.completion_tokens);
        (usage.total_tokens > 0).then_some(usage)
    }

    /// Usage totals not yet handed out through [`Emission::Usage`]. Marks
    /// them as handed out.
    pub fn take_usage(&mut self) -> Option<Usage> {
        if self.usage_reported {
            return None;
        }
        let usage = self.usage()?;
        self.usage_reported = true;
        Some(usage)
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// `stop` for a natural end of turn or no stop reason at all, `length`
    /// for any other stop reason.
    pub fn finish_reason(&self) -> &'static str {
        match self.stop_reason.as_deref() {
            None | Some("end_turn") => "stop",
            Some(_) => "length",
        }
    }

    /// Replacement content when the agent produced none but wrote to stderr.
    pub fn stderr_fallback(&self, stderr: &str) -> Option<String> {
        let stderr = stderr.trim();
        (self.content.is_empty() && !stderr.is_empty()).then(|| format!("Error: {stderr}"))
    }

    /// Aggregate everything seen so far, applying the stderr fallback.
    pub fn finish(self, stderr: &str) -> Completion {
        let content = self.stderr_fallback(stderr).unwrap_or_else(|| self.content.clone());
        Completion {
            finish_reason: self.finish_reason(),
            usage: self.usage(),
            session_id: self.session_id,
            content,
        }
    }
}

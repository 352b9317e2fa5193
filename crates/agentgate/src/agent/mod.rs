//! The external command-line agent: its event protocol, prompt
//! construction, and process lifecycle.

mod events;
mod process;
mod prompt;

pub use events::{
    AgentEvent, ContentDelta, MessageDelta, ResultEvent, StreamEventBody, StreamMessage, TokenUsage,
};
pub use process::{
    AgentProcess, AgentSettings, Invocation, KILL_GRACE, ProcessControl, ProcessState,
    StderrCollector, build_args, format_exit_status, spawn,
};
pub use prompt::{ImageStore, Prompt, build_prompt};

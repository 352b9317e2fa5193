//! Working-directory confirmation.
//!
//! A new conversation must name the directory the agent is rooted in before
//! any agent process is started. The exchange happens in-band: the gateway
//! answers with synthetic assistant turns (prompt, rejection, confirmation)
//! and the client echoes them back as history on its next request, so the
//! decision is recomputed from the message list alone on every request.
//!
//! ## Rules
//!
//! 1. A user turn immediately followed (ignoring system messages) by an
//!    assistant turn, whose text resolves to an existing directory, is a
//!    confirmed pair. The earliest pair wins and is pruned from the history.
//! 2. Otherwise, any assistant turn that is not one of our synthetic replies
//!    marks the conversation as pre-existing: use the default directory.
//! 3. Otherwise the newest user turn is inspected: a directory confirms it,
//!    a path-shaped but unusable value is rejected, anything else is
//!    answered with the prompt.

mod resolve;

use std::path::PathBuf;

pub use resolve::{PathCandidate, resolve_directory};

use crate::openai::{ChatMessage, Role};

/// Reply asking the user for a working directory.
pub const WORKDIR_PROMPT: &str = "Before I start, which directory should I work in? \
Reply with an absolute path to an existing directory, for example `/home/me/project` or `~/project`.";

const INVALID_PREFIX: &str = "I can't use that as a working directory:";
const CONFIRMED_PREFIX: &str = "Working directory set to";

/// Reply rejecting a path-shaped but unusable directory.
pub fn invalid_reply(path_text: &str) -> String {
    format!(
        "{INVALID_PREFIX} `{path_text}` is not an existing directory. \
         Reply with an absolute path to an existing directory."
    )
}

/// Reply confirming the working directory.
pub fn confirmed_reply(path: &std::path::Path) -> String {
    format!(
        "{CONFIRMED_PREFIX} `{}`. What would you like me to do?",
        path.display()
    )
}

/// Whether `text` is one of the synthetic replies above.
pub fn is_synthetic_reply(text: &str) -> bool {
    let text = text.trim();
    text == WORKDIR_PROMPT || text.starts_with(INVALID_PREFIX) || text.starts_with(CONFIRMED_PREFIX)
}

/// Outcome of inspecting a request's message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkdirDecision {
    /// No directory yet; ask for one.
    NeedPrompt,
    /// The newest user turn named an unusable path.
    Invalid(String),
    /// The newest user turn named a usable directory; confirm it.
    Confirmed(PathBuf),
    /// Conversation started elsewhere; run in the configured default.
    UseDefault,
    /// A confirmed directory exists; run there with the pair removed.
    Resume {
        path: PathBuf,
        messages: Vec<ChatMessage>,
    },
}

impl WorkdirDecision {
    /// Text of the synthetic assistant turn to return instead of invoking
    /// the agent, if this decision short-circuits the request.
    pub fn synthetic_reply(&self) -> Option<String> {
        match self {
            Self::NeedPrompt => Some(WORKDIR_PROMPT.to_string()),
            Self::Invalid(text) => Some(invalid_reply(text)),
            Self::Confirmed(path) => Some(confirmed_reply(path)),
            Self::UseDefault | Self::Resume { .. } => None,
        }
    }
}

/// Decide how to handle a request from its full message list.
///
/// Pure apart from filesystem lookups used to validate candidate paths.
pub fn decide(messages: &[ChatMessage]) -> WorkdirDecision {
    let turns: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| !m.role.is_system())
        .map(|(i, _)| i)
        .collect();

    for pair in turns.windows(2) {
        let (user_idx, reply_idx) = (pair[0], pair[1]);
        if messages[user_idx].role != Role::User || messages[reply_idx].role != Role::Assistant {
            continue;
        }
        if let PathCandidate::Directory(path) = resolve_directory(&messages[user_idx].text()) {
            let pruned = messages
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != user_idx && *i != reply_idx)
                .map(|(_, m)| m.clone())
                .collect();
            return WorkdirDecision::Resume {
                path,
                messages: pruned,
            };
        }
    }

    let external = messages
        .iter()
        .any(|m| m.role == Role::Assistant && !is_synthetic_reply(&m.text()));
    if external {
        return WorkdirDecision::UseDefault;
    }

    let Some(newest) = messages.iter().rev().find(|m| m.role == Role::User) else {
        return WorkdirDecision::NeedPrompt;
    };

    match resolve_directory(&newest.text()) {
        PathCandidate::Directory(path) => WorkdirDecision::Confirmed(path),
        PathCandidate::Invalid(text) => WorkdirDecision::Invalid(text),
        PathCandidate::NotPath => WorkdirDecision::NeedPrompt,
    }
}

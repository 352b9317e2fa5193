//! Request orchestration: working-directory gate, session lookup, agent
//! invocation, translation, and session recording.

mod stream;

use std::path::PathBuf;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::agent::{self, AgentProcess, AgentSettings, ImageStore, Invocation, Prompt};
use crate::api::ApiError;
use crate::config::GatewayConfig;
use crate::models::resolve_model;
use crate::openai::{
    ChatCompletionChunk, ChatCompletionResponse, ChatMessage, CompletionFrame, Role,
};
use crate::session::SessionStore;
use crate::translator::{Completion, EventReader, StreamTranslator};
use crate::workdir::{self, WorkdirDecision};

/// Settings the chat path needs, split out of [`GatewayConfig`].
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub agent: AgentSettings,
    pub default_model: String,
    pub default_cwd: PathBuf,
    pub confirm_workdir: bool,
}

impl From<&GatewayConfig> for ChatSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            agent: config.agent.clone(),
            default_model: config.default_model.clone(),
            default_cwd: config.default_cwd.clone(),
            confirm_workdir: config.confirm_workdir,
        }
    }
}

/// What to do with one request.
#[derive(Debug)]
enum Plan {
    /// Answer with a fixed assistant turn; no agent runs.
    Synthetic(String),
    Run(RunPlan),
}

#[derive(Debug)]
struct RunPlan {
    cwd: PathBuf,
    /// Forwarded history: the request's messages minus any confirmed
    /// working-directory exchange.
    messages: Vec<ChatMessage>,
    resume: Option<String>,
}

/// A spawned invocation together with everything needed to finish it.
struct Running {
    frame: CompletionFrame,
    messages: Vec<ChatMessage>,
    process: AgentProcess,
}

/// Result of preparing a request.
enum Prepared {
    Synthetic(CompletionFrame, String),
    Running(Running),
}

pub struct ChatService {
    settings: ChatSettings,
    sessions: Arc<SessionStore>,
    images: ImageStore,
}

impl ChatService {
    pub fn new(settings: ChatSettings, sessions: Arc<SessionStore>, images: ImageStore) -> Self {
        Self {
            settings,
            sessions,
            images,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Serve a non-streaming request.
    pub async fn complete(
        &self,
        model: Option<&str>,
        messages: Vec<ChatMessage>,
    ) -> Result<ChatCompletionResponse, ApiError> {
        let running = match self.prepare(model, messages, false).await? {
            Prepared::Synthetic(frame, text) => return Ok(frame.response(text, "stop", None)),
            Prepared::Running(running) => running,
        };
        let Running {
            frame,
            messages,
            process,
        } = running;
        let AgentProcess {
            stdout,
            stderr,
            control,
        } = process;

        // Dropping this future (client went away) terminates the agent.
        let guard = control.cancel_on_drop();

        let mut reader = EventReader::new(stdout);
        let mut translator = StreamTranslator::new();
        loop {
            match reader.next_event().await {
                Ok(Some(event)) => {
                    translator.on_event(&event);
                }
                Ok(None) => break,
                Err(e) => {
                    control.cancel();
                    return Err(ApiError::internal(format!(
                        "failed to read agent output: {e}"
                    )));
                }
            }
        }

        let stderr = stderr.collect().await;
        let exit = control.wait().await;
        guard.disarm();

        let completion = translator.finish(&stderr);
        info!(
            request_id = %frame.id,
            exit_code = ?exit,
            timed_out = control.timed_out(),
            finish_reason = completion.finish_reason,
            session_id = ?completion.session_id,
            "Completion finished"
        );
        self.record(&messages, &completion);

        Ok(frame.response(
            completion.content,
            completion.finish_reason,
            completion.usage,
        ))
    }

    /// Serve a streaming request. Chunks arrive on the returned stream; the
    /// caller appends the end-of-stream sentinel.
    pub async fn stream(
        self: &Arc<Self>,
        model: Option<&str>,
        messages: Vec<ChatMessage>,
    ) -> Result<ReceiverStream<ChatCompletionChunk>, ApiError> {
        match self.prepare(model, messages, true).await? {
            Prepared::Synthetic(frame, text) => Ok(stream::synthetic(frame, text)),
            Prepared::Running(running) => Ok(stream::spawn_pump(Arc::clone(self), running)),
        }
    }

    async fn prepare(
        &self,
        model: Option<&str>,
        messages: Vec<ChatMessage>,
        streaming: bool,
    ) -> Result<Prepared, ApiError> {
        let model = resolve_model(model, &self.settings.default_model);
        let frame = CompletionFrame::new(model);
        let message_count = messages.len();

        let run = match self.plan(messages) {
            Plan::Synthetic(text) => {
                info!(
                    request_id = %frame.id,
                    model = %frame.model,
                    messages = message_count,
                    stream = streaming,
                    "Answering with working-directory exchange"
                );
                return Ok(Prepared::Synthetic(frame, text));
            }
            Plan::Run(run) => run,
        };

        info!(
            request_id = %frame.id,
            model = %frame.model,
            messages = message_count,
            stream = streaming,
            session = if run.resume.is_some() { "hit" } else { "miss" },
            cwd = %run.cwd.display(),
            "Invoking agent"
        );

        let prompt = agent::build_prompt(&run.messages, run.resume.is_some(), &self.images).await;
        let process = self.spawn(&frame, &prompt, &run)?;
        info!(request_id = %frame.id, pid = ?process.control.pid(), "Agent started");

        Ok(Prepared::Running(Running {
            frame,
            messages: run.messages,
            process,
        }))
    }

    fn plan(&self, messages: Vec<ChatMessage>) -> Plan {
        let decision = if self.settings.confirm_workdir {
            workdir::decide(&messages)
        } else {
            WorkdirDecision::UseDefault
        };

        if let Some(text) = decision.synthetic_reply() {
            return Plan::Synthetic(text);
        }

        let (cwd, messages) = match decision {
            WorkdirDecision::Resume { path, messages } => (path, messages),
            _ => (self.settings.default_cwd.clone(), messages),
        };

        let resume = self.sessions.lookup(lookup_context(&messages));
        Plan::Run(RunPlan {
            cwd,
            messages,
            resume,
        })
    }

    fn spawn(
        &self,
        frame: &CompletionFrame,
        prompt: &Prompt,
        run: &RunPlan,
    ) -> Result<AgentProcess, ApiError> {
        let invocation = Invocation {
            model: &frame.model,
            prompt,
            resume: run.resume.as_deref(),
            cwd: &run.cwd,
        };
        agent::spawn(&self.settings.agent, &invocation).map_err(|e| {
            warn!(request_id = %frame.id, error = %format!("{e:#}"), "Agent spawn failed");
            ApiError::from(e)
        })
    }

    /// Remember the session the agent reported, keyed by the conversation
    /// including the turn it just produced.
    fn record(&self, messages: &[ChatMessage], completion: &Completion) {
        let Some(session_id) = completion.session_id.as_deref() else {
            return;
        };
        let mut context = messages.to_vec();
        context.push(ChatMessage::assistant(completion.content.clone()));
        self.sessions.store(&context, session_id);
    }
}

/// History preceding the newest user turn.
fn lookup_context(messages: &[ChatMessage]) -> &[ChatMessage] {
    match messages.split_last() {
        Some((last, rest)) if last.role == Role::User => rest,
        _ => messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStoreConfig;

    fn service(confirm_workdir: bool) -> ChatService {
        let dir = std::env::temp_dir();
        ChatService::new(
            ChatSettings {
                agent: AgentSettings::default(),
                default_model: "sonnet".to_string(),
                default_cwd: dir.clone(),
                confirm_workdir,
            },
            Arc::new(SessionStore::new(SessionStoreConfig::default())),
            ImageStore::new(dir.join("agentgate-test-images")),
        )
    }

    #[test]
    fn test_lookup_context_drops_trailing_user_turn() {
        let messages = vec![
            ChatMessage::user("a"),
            ChatMessage::assistant("b"),
            ChatMessage::user("c"),
        ];
        assert_eq!(lookup_context(&messages), &messages[..2]);

        let ends_with_assistant = vec![ChatMessage::user("a"), ChatMessage::assistant("b")];
        assert_eq!(lookup_context(&ends_with_assistant), &ends_with_assistant[..]);
        assert!(lookup_context(&[]).is_empty());
    }

    #[test]
    fn test_plan_prompts_for_workdir() {
        match service(true).plan(vec![ChatMessage::user("hello")]) {
            Plan::Synthetic(text) => assert_eq!(text, workdir::WORKDIR_PROMPT),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_plan_without_confirmation_uses_default() {
        let svc = service(false);
        match svc.plan(vec![ChatMessage::user("hello")]) {
            Plan::Run(run) => {
                assert_eq!(run.cwd, svc.settings.default_cwd);
                assert_eq!(run.resume, None);
                assert_eq!(run.messages.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_plan_resumes_from_pruned_history() {
        let svc = service(true);
        let tmp = std::fs::canonicalize("/tmp").unwrap();
        let forwarded = vec![ChatMessage::user("hello"), ChatMessage::assistant("hi!")];
        svc.sessions.store(&forwarded, "sess-1");

        let plan = svc.plan(vec![
            ChatMessage::user("/tmp"),
            ChatMessage::assistant("ok"),
            ChatMessage::user("hello"),
            ChatMessage::assistant("hi!"),
            ChatMessage::user("and now?"),
        ]);
        match plan {
            Plan::Run(run) => {
                assert_eq!(run.cwd, tmp);
                assert_eq!(run.resume.as_deref(), Some("sess-1"));
                assert_eq!(run.messages.len(), 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_record_keys_on_extended_context() {
        let svc = service(false);
        let messages = vec![ChatMessage::user("hi")];
        svc.record(
            &messages,
            &Completion {
                content: "Hello!".to_string(),
                finish_reason: "stop",
                usage: None,
                session_id: Some("abc".to_string()),
            },
        );
        let extended = vec![ChatMessage::user("hi"), ChatMessage::assistant("Hello!")];
        assert_eq!(svc.sessions.lookup(&extended).as_deref(), Some("abc"));
        assert_eq!(svc.sessions.lookup(&messages), None);
    }

    #[test]
    fn test_record_without_session_id_is_noop() {
        let svc = service(false);
        svc.record(
            &[ChatMessage::user("hi")],
            &Completion {
                content: "x".to_string(),
                finish_reason: "stop",
                usage: None,
                session_id: None,
            },
        );
        assert!(svc.sessions.is_empty());
    }
}

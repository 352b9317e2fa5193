//! Streaming delivery.
//!
//! A pump task reads agent events and forwards translated chunks over a
//! bounded channel. The channel closing means the client went away: the
//! pump stops writing and terminates the agent.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::{ChatService, Running};
use crate::agent::AgentProcess;
use crate::openai::{ChatCompletionChunk, CompletionFrame};
use crate::translator::{Emission, EventReader, StreamTranslator};

const CHANNEL_CAPACITY: usize = 64;

/// Role, content, and stop chunks for a fixed reply.
pub(super) fn synthetic(frame: CompletionFrame, text: String) -> ReceiverStream<ChatCompletionChunk> {
    let (tx, rx) = mpsc::channel(3);
    for chunk in [
        frame.role_chunk(),
        frame.content_chunk(text),
        frame.stop_chunk("stop"),
    ] {
        // Capacity matches the chunk count.
        let _ = tx.try_send(chunk);
    }
    ReceiverStream::new(rx)
}

pub(super) fn spawn_pump(
    service: Arc<ChatService>,
    running: Running,
) -> ReceiverStream<ChatCompletionChunk> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(async move {
        pump(&service, running, tx).await;
    });
    ReceiverStream::new(rx)
}

/// Sender that remembers whether the receiver is gone.
struct Outbox {
    tx: mpsc::Sender<ChatCompletionChunk>,
    open: bool,
}

impl Outbox {
    async fn send(&mut self, chunk: ChatCompletionChunk) -> bool {
        if self.open && self.tx.send(chunk).await.is_err() {
            self.open = false;
        }
        self.open
    }
}

async fn pump(service: &ChatService, running: Running, tx: mpsc::Sender<ChatCompletionChunk>) {
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

    let mut out = Outbox {
        tx: tx.clone(),
        open: true,
    };
    let mut reader = EventReader::new(stdout);
    let mut translator = StreamTranslator::new();

    out.send(frame.role_chunk()).await;

    while out.open {
        let next = tokio::select! {
            _ = tx.closed() => {
                out.open = false;
                break;
            }
            next = reader.next_event() => next,
        };

        match next {
            Ok(Some(event)) => {
                for emission in translator.on_event(&event) {
                    let chunk = match emission {
                        Emission::Content(text) => frame.content_chunk(text),
                        Emission::Usage(usage) => frame.usage_chunk(usage),
                    };
                    if !out.send(chunk).await {
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(request_id = %frame.id, error = %e, "Failed to read agent output");
                control.cancel();
                let note =
                    translator.annotate_error(&format!("failed to read agent output: {e}"));
                out.send(frame.content_chunk(note)).await;
                break;
            }
        }
    }

    if !out.open {
        info!(request_id = %frame.id, pid = ?control.pid(), "Client disconnected, terminating agent");
        control.cancel();
    }

    let stderr = stderr.collect().await;

    if out.open {
        if let Some(usage) = translator.take_usage() {
            out.send(frame.usage_chunk(usage)).await;
        }
        match translator.stderr_fallback(&stderr) {
            // The fallback chunk carries the finish reason itself.
            Some(fallback) => {
                out.send(frame.terminal_content_chunk(fallback, "stop")).await;
            }
            None => {
                out.send(frame.stop_chunk(translator.finish_reason())).await;
            }
        }
    }
    drop(out);
    drop(tx);

    let exit = control.wait().await;
    let completion = translator.finish(&stderr);
    info!(
        request_id = %frame.id,
        exit_code = ?exit,
        timed_out = control.timed_out(),
        cancelled = control.termination_requested() && !control.timed_out(),
        finish_reason = completion.finish_reason,
        session_id = ?completion.session_id,
        "Stream finished"
    );
    service.record(&messages, &completion);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use crate::openai::Role;

    #[tokio::test]
    async fn test_synthetic_stream_shape() {
        let frame = CompletionFrame::new("m");
        let chunks: Vec<_> = synthetic(frame.clone(), "pick a dir".to_string())
            .collect()
            .await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].choices[0].delta.role, Some(Role::Assistant));
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("pick a dir"));
        assert_eq!(chunks[2].choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(chunks.iter().all(|c| c.id == frame.id));
    }
}

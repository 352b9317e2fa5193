//! agentgate: an OpenAI-compatible chat-completions gateway that runs a
//! command-line coding agent once per request.

pub mod agent;
pub mod api;
pub mod autostart;
pub mod chat;
pub mod config;
pub mod models;
pub mod openai;
pub mod server;
pub mod session;
pub mod translator;
pub mod workdir;

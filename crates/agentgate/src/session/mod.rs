//! Conversation continuity across stateless agent invocations.
//!
//! Each successful invocation that reports an agent session id is recorded
//! under the digest of the full conversation it produced (request messages
//! plus the generated assistant turn). A later request whose history, minus
//! its newest user turn, hashes to the same digest resumes that session.

mod digest;
mod store;

pub use digest::context_digest;
pub use store::{SessionEntry, SessionStore, SessionStoreConfig};

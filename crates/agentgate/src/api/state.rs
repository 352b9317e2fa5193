//! Application state shared across handlers.

use std::sync::Arc;

use crate::chat::ChatService;

/// Authentication settings for the API layer.
#[derive(Clone, Debug, Default)]
pub struct AuthState {
    /// Bearer token clients must present. `None` disables authentication.
    pub api_key: Option<Arc<str>>,
}

impl AuthState {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.map(Arc::from),
        }
    }
}

/// HTTP surface settings.
#[derive(Clone, Debug)]
pub struct HttpState {
    /// CORS origins. Empty allows any.
    pub allowed_origins: Vec<String>,
    pub max_body_bytes: usize,
}

impl Default for HttpState {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_body_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub auth: AuthState,
    pub http: HttpState,
}

impl AppState {
    pub fn new(chat: Arc<ChatService>, auth: AuthState, http: HttpState) -> Self {
        Self { chat, auth, http }
    }
}

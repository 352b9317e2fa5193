//! HTTP API module.
//!
//! OpenAI-compatible endpoints plus a health check.

mod auth;
mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, AuthError};
pub use routes::create_router;
pub use state::{AppState, AuthState, HttpState};

//! HTTP server over the session manager.
//!
//! - [`http_api`]: Request/response types and route handlers
//! - [`streaming`]: SSE streaming for token-by-token completions

pub mod http_api;
pub mod streaming;

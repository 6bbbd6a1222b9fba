//! HTTP server for the chat gateway.
//!
//! - [`api`]: Request/response types and route handlers
//! - [`streaming`]: SSE framing for streamed answers

pub mod api;
pub mod streaming;

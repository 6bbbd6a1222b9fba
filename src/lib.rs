//! foundry-chat: a thin chat gateway for a locally hosted model runtime.
//!
//! Proxies single-turn chat requests to a Foundry Local model through its
//! OpenAI-compatible API and relays the answer, whole or as a server-sent
//! event stream. The connection to the runtime is built lazily on first use
//! and shared by every request afterwards.

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod runtime;
pub mod server;

//! Upstream dispatcher: per-credential HTTP client cache, the four Code
//! Assist operations (`generate`, `stream`, `count_tokens`, `action`), the
//! credential-rotation loop, model-fallback chains, the SSE pump, fake
//! streaming, and anti-truncation continuation — spec §4.4.

pub mod anti_truncation;
pub mod client;
pub mod dispatcher;
pub mod policy;
pub mod sse;

pub use client::ClientCache;
pub use dispatcher::{Dispatcher, DispatchOutcome};

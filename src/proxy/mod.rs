//! Proxy engine: dialect translation, SSE framing and the per-request
//! attempt loop (C3, C4 via `crate::sentinel`, C6 via `crate::concurrency`,
//! C7).

pub mod dialect;
pub mod engine;
pub mod error;
pub mod sse;

pub use error::{ProxyError, ProxyResult};

//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, WebSocket connection management,
//! HTTP API wrappers, retry/backoff helpers and the [`bridge::EngineBridge`]
//! that drives one computation graph from submission to saved artifacts.

pub mod api;
pub mod backoff;
pub mod bridge;
pub mod catalog;
pub mod client;
pub mod events;
pub mod messages;
pub mod processor;

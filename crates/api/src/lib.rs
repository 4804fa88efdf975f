//! Kiln render gateway server library.
//!
//! Exposes the building blocks (config, state, error handling, scheduler,
//! routes, WebSocket handler) so integration tests and the binary
//! entrypoint share them.

pub mod background;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod history;
pub mod middleware;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
pub mod upload;
pub mod ws;

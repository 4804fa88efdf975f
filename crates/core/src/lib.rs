//! Domain layer for the kiln render gateway.
//!
//! Everything here is engine-agnostic: session identity, licensing,
//! content screening, per-caller quotas, generation parameters and the
//! single-flight job queue. HTTP and engine concerns live in the
//! `kiln-api` and `kiln-comfyui` crates.

pub mod content_policy;
pub mod error;
pub mod generation;
pub mod license;
pub mod queue;
pub mod quota;
pub mod scheduling;
pub mod session;
pub mod types;

//! Turns a queued job into rendered artifacts.
//!
//! - [`graph`]: append-only computation graph builder.
//! - [`workflow`]: the generation graph layout.
//! - [`assets`]: resolving, downloading and publishing weight assets.
//! - [`executor`]: the [`executor::JobExecutor`] seam the scheduler drives.

pub mod assets;
pub mod executor;
pub mod graph;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

//! Per-job event fan-out.
//!
//! - [`JobEvent`] is what subscribers of a job see, in the order it happened.
//! - [`JobEventHub`] keeps one broadcast channel per live job.
//! - [`JobEventPublisher`] is a hub handle bound to one job id, handed to
//!   the code that executes that job.

pub mod bus;

pub use bus::{JobEvent, JobEventHub, JobEventPublisher};

//! Job admission and the single-flight execution loop.

pub mod scheduler;

pub use scheduler::{Admission, Attachment, QueueSnapshot, Scheduler};

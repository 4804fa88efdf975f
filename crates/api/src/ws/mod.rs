//! WebSocket push of job events.
//!
//! One connection follows one job. The stream ends after the job's
//! terminal event.

mod handler;

pub use handler::job_events;

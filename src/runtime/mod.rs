//! Event loop runtime.
//!
//! [`ContextBuilder`] assembles the policy, readiness notifiers and preset
//! blobs; [`EventLoop`] owns them together with every session and services
//! transport events, timers and readiness resumes on one task.

mod context;
mod event_loop;

pub use context::*;
pub use event_loop::*;

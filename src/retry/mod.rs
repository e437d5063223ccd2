//! Retry and backoff.
//!
//! The backoff rules hold the pure delay and concealment rules; [`RetryTracker`]
//! applies them to the failure history of one session.

mod backoff;
mod tracker;

pub use backoff::*;
pub use tracker::*;

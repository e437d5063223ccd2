//! Secure Streams - Core traits, types, and constants.
//!
//! This module provides the foundational types shared by the policy, session,
//! readiness and runtime layers. It has no I/O dependencies.

mod constants;
mod error;
mod traits;

pub use constants::*;
pub use error::*;
pub use traits::*;

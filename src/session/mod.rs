//! Secure stream sessions.
//!
//! A [`SecureStream`] is a sans-io state machine: it is fed transport events
//! and timer expiries with an explicit `now`, and it emits
//! [`SessionAction`]s for the runtime to carry out.

mod handle;
mod state;
mod stream;

pub use handle::*;
pub use state::*;
pub use stream::*;

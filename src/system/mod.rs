//! Process-level state: device blobs and the readiness state machine.

mod blob;
mod notifiers;
mod readiness;

pub use blob::*;
pub use notifiers::*;
pub use readiness::*;

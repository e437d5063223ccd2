//! Transport boundary.
//!
//! Sessions speak to the network through this module's vocabulary: a
//! [`ConnectRequest`] goes out, [`TransportEvent`]s come back tagged with a
//! [`ConnectionId`]. The `runtime` feature adds the [`Transport`] provider
//! trait and a TCP / TLS / HTTP provider.

mod event;

#[cfg(feature = "runtime")]
mod provider;

#[cfg(feature = "runtime")]
mod tcp;

pub use event::*;

#[cfg(feature = "runtime")]
pub use provider::*;

#[cfg(feature = "runtime")]
pub use tcp::*;

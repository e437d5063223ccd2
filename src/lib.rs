//! # Secure Streams
//!
//! Policy-driven client sessions. Applications open streams by **type
//! name**; a policy maps each type to an endpoint, protocol, TLS trust
//! chain and retry strategy. The crate provides:
//!
//! - **Policy**: named retry strategies, certificates, trust stores and
//!   stream templates, with overlay of fetched or test fragments
//! - **Sessions**: a sans-io state machine per stream that connects,
//!   retries with backoff and jitter, conceals early failures and enforces
//!   validity and absolute timeouts
//! - **Readiness**: a process-level stage machine gated by notifiers, with
//!   built-in captive portal, policy fetch and credential notifiers
//! - **Runtime**: a single-task event loop and a TCP / TLS / HTTP
//!   transport provider trusting only the policy's certificates
//!
//! ## Feature Flags
//!
//! - `runtime` (default): event loop, `Transport` trait and TCP / TLS / HTTP provider
//! - `json` (default): JSON policy documents
//!
//! ## Modules
//!
//! - [`core`]: errors, constants and the payload interface (always included)
//! - [`policy`]: policy model, overlay and loader trait
//! - [`retry`]: backoff engine and retry tracker
//! - [`session`]: the per-stream session state machine
//! - [`system`]: blob store, readiness machine and notifiers
//! - [`transport`]: connection vocabulary and providers
//! - [`runtime`]: context builder and event loop (requires `runtime` feature)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use secure_streams::prelude::*;
//!
//! struct Print;
//!
//! impl SessionHandler for Print {
//!     fn on_receive(&mut self, _: &mut StreamHandle<'_>, data: &[u8], flags: RxFlags) -> RxOutcome {
//!         println!("{}", String::from_utf8_lossy(data));
//!         if flags.eom { RxOutcome::Close } else { RxOutcome::Continue }
//!     }
//!
//!     fn on_state_change(&mut self, stream: &mut StreamHandle<'_>, state: SessionState, _: TxOrdinal) {
//!         println!("{}: {state}", stream.id());
//!     }
//! }
//!
//! # async fn demo() -> Result<(), StreamError> {
//! let policy = Policy::builder()
//!     .stream(StreamTemplate::new("mintest", "example.com", 80, StreamProtocol::H1).with_http("GET", "/"))?
//!     .build()?;
//!
//! let mut context = ContextBuilder::new().policy(policy).build(TcpTransport::new())?;
//! context.request_stage(ReadinessStage::Operational)?;
//! context.create_stream("mintest", Print)?;
//! while context.turn().await? {}
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

pub mod policy;
pub mod retry;
pub mod session;
pub mod system;
pub mod transport;

// Event loop (feature-gated)
#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub mod runtime;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;
    pub use crate::policy::*;
    pub use crate::session::{SecureStream, SessionState, StreamHandle, StreamId, StreamOptions};
    pub use crate::system::{
        BlobKey, BlobStore, CaptivePortalNotifier, CredentialNotifier, Notification,
        NotifyContext, OverlayNotifier, PolicyFetchNotifier, ReadinessNotifier, ReadinessStage,
        ResumeHandle, StaticCredentials,
    };

    #[cfg(feature = "runtime")]
    pub use crate::runtime::*;

    #[cfg(feature = "runtime")]
    pub use crate::transport::{EventSink, TcpTransport, Transport};
}

// Re-export commonly used items at crate root
pub use core::{SessionHandler, StreamError};
pub use policy::{Policy, PolicyHandle};
pub use session::{SessionState, StreamId};
pub use system::ReadinessStage;

#[cfg(feature = "runtime")]
pub use runtime::{ContextBuilder, EventLoop};

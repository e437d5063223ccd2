//! Payload interface between a session and the application.
//!
//! Every secure stream owns one [`SessionHandler`]. The session calls into it
//! for received data, for outbound payload when the transport can send, and
//! on every visible state transition.

use crate::session::{SessionState, StreamHandle};

/// Ordinal of a transmitted message, used to correlate acknowledgements.
pub type TxOrdinal = u32;

/// Flags attached to a receive callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxFlags {
    /// First fragment of a message.
    pub som: bool,
    /// Last fragment of a message (logical response unit complete).
    pub eom: bool,
}

impl RxFlags {
    /// Flags for a fragment in the middle of a message.
    pub const MIDDLE: Self = Self {
        som: false,
        eom: false,
    };
}

/// What the session should do after a receive callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// Keep the session open.
    Continue,
    /// Message is complete and the session should close.
    Close,
}

/// Answer to a transmit request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    /// Send this payload; `more_pending` asks to be called again.
    Send {
        /// Bytes to send.
        payload: Vec<u8>,
        /// Whether another payload is ready immediately.
        more_pending: bool,
    },
    /// Nothing to send on this occasion (valid for pure-download streams).
    Decline,
}

/// Application side of a secure stream.
///
/// Callbacks run on the event loop and must not block. They may queue
/// requests (connect, close, transmit, timeout, metadata) through the
/// [`StreamHandle`]; the session applies them once the callback returns.
///
/// # Example
///
/// ```ignore
/// struct Download { body: Vec<u8> }
///
/// impl SessionHandler for Download {
///     fn on_receive(&mut self, _: &mut StreamHandle<'_>, data: &[u8], flags: RxFlags) -> RxOutcome {
///         self.body.extend_from_slice(data);
///         if flags.eom { RxOutcome::Close } else { RxOutcome::Continue }
///     }
///
///     fn on_state_change(&mut self, _: &mut StreamHandle<'_>, state: SessionState, _: TxOrdinal) {
///         println!("state {state}");
///     }
/// }
/// ```
pub trait SessionHandler {
    /// Data arrived while connected.
    fn on_receive(
        &mut self,
        stream: &mut StreamHandle<'_>,
        data: &[u8],
        flags: RxFlags,
    ) -> RxOutcome;

    /// The transport is ready to send.
    ///
    /// The default declines, which suits download-only streams.
    fn on_transmit_request(
        &mut self,
        stream: &mut StreamHandle<'_>,
        ordinal: TxOrdinal,
    ) -> TxOutcome {
        let _ = (stream, ordinal);
        TxOutcome::Decline
    }

    /// The session moved to `state`. Called once per visible transition.
    fn on_state_change(
        &mut self,
        stream: &mut StreamHandle<'_>,
        state: SessionState,
        ack: TxOrdinal,
    );
}

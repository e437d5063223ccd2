//! Transport provider trait and the channel back into the event loop.

use tokio::sync::mpsc;

use super::event::{ConnectRequest, ConnectionId, TransportEvent};

/// Everything the event loop wakes up for.
#[derive(Debug)]
pub(crate) enum LoopEvent {
    /// A transport event for one connection.
    Transport {
        conn: ConnectionId,
        event: TransportEvent,
    },
    /// A readiness notifier asked for its step to be re-run.
    ResumeReadiness,
    /// Stop the loop.
    Shutdown,
}

/// Where transports post connection events.
///
/// Cheap to clone and usable from any task or thread.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self { tx }
    }

    /// Post an event for `conn`. Returns `false` once the loop is gone.
    pub fn post(&self, conn: ConnectionId, event: TransportEvent) -> bool {
        self.tx.send(LoopEvent::Transport { conn, event }).is_ok()
    }
}

/// A network provider.
///
/// Calls come from the event loop and must not block; results are posted
/// back through the [`EventSink`] handed to [`connect`](Self::connect).
pub trait Transport {
    /// Open a connection and report `Connected` or `Failed` for `conn`.
    fn connect(&mut self, conn: ConnectionId, request: ConnectRequest, sink: EventSink);

    /// Write a payload; report `Writable` once it is flushed.
    fn send(&mut self, conn: ConnectionId, payload: Vec<u8>);

    /// Send a validity ping; report `Pong` when answered.
    ///
    /// The default does nothing, which leaves hangup detection to the
    /// validity interval.
    fn ping(&mut self, conn: ConnectionId) {
        let _ = conn;
    }

    /// Drop a connection. No further events are expected for `conn`.
    fn close(&mut self, conn: ConnectionId);
}

//! The handle passed to every [`SessionHandler`](crate::core::SessionHandler)
//! callback.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::state::SessionState;
use super::stream::AttemptFailure;

/// Identifies a stream within an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ss-{}", self.0)
    }
}

/// Requests a handler queues during a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamRequest {
    Connect,
    Close,
    RequestTx,
    StartTimeout(Duration),
    CancelTimeout,
}

/// Callback-scoped view of a stream.
///
/// Requests made through the handle take effect after the callback
/// returns, in the order they were made.
pub struct StreamHandle<'a> {
    pub(crate) id: StreamId,
    pub(crate) stream_type: &'a str,
    pub(crate) state: SessionState,
    pub(crate) metadata: &'a mut HashMap<String, Vec<u8>>,
    pub(crate) requests: &'a mut Vec<StreamRequest>,
    pub(crate) last_failure: Option<&'a AttemptFailure>,
}

impl StreamHandle<'_> {
    /// Stream id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Stream type the session was created from.
    pub fn stream_type(&self) -> &str {
        self.stream_type
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Start a connection attempt now, cancelling any pending retry wait.
    pub fn connect(&mut self) {
        self.requests.push(StreamRequest::Connect);
    }

    /// Close the session.
    pub fn close(&mut self) {
        self.requests.push(StreamRequest::Close);
    }

    /// Ask for a transmit callback once the transport can send.
    pub fn request_tx(&mut self) {
        self.requests.push(StreamRequest::RequestTx);
    }

    /// Arm (or re-arm) the absolute session timeout.
    pub fn start_timeout(&mut self, timeout: Duration) {
        self.requests.push(StreamRequest::StartTimeout(timeout));
    }

    /// Disarm the absolute session timeout.
    pub fn cancel_timeout(&mut self) {
        self.requests.push(StreamRequest::CancelTimeout);
    }

    /// Set a metadata value. Transports see it from the next attempt on.
    pub fn set_metadata(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.metadata.insert(name.into(), value.into());
    }

    /// Read a metadata value.
    pub fn metadata(&self, name: &str) -> Option<&[u8]> {
        self.metadata.get(name).map(Vec::as_slice)
    }

    /// Why the most recent attempt failed, if one has.
    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        self.last_failure
    }
}

impl fmt::Debug for StreamHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id)
            .field("stream_type", &self.stream_type)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

//! Connection vocabulary shared by sessions and transport providers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::core::TransportError;
use crate::policy::{StreamProtocol, TrustChain};
use crate::session::StreamId;

/// Identifies one connection attempt of one stream.
///
/// Events carrying the id of an earlier attempt are stale and dropped by
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    /// Owning stream.
    pub stream: StreamId,
    /// 1-based attempt number within the stream.
    pub attempt: u32,
}

impl ConnectionId {
    /// Create a connection id.
    pub fn new(stream: StreamId, attempt: u32) -> Self {
        Self { stream, attempt }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream, self.attempt)
    }
}

/// Everything a transport needs to open a connection for a template.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Endpoint host name.
    pub endpoint: String,
    /// Endpoint port.
    pub port: u16,
    /// Wire protocol.
    pub protocol: StreamProtocol,
    /// TLS required.
    pub tls: bool,
    /// HTTP method for HTTP protocols.
    pub http_method: Option<String>,
    /// HTTP URL path for HTTP protocols.
    pub http_url: Option<String>,
    /// Verification roots when TLS is required.
    pub trust: Option<TrustChain>,
    /// Per-stream metadata (extra headers for HTTP transports).
    pub metadata: HashMap<String, Vec<u8>>,
    /// Metadata names mapped to HTTP header names.
    pub metadata_headers: BTreeMap<String, String>,
}

/// Events a transport reports for a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connection established; HTTP transports include the response status.
    Connected {
        /// Response status, if the protocol has one.
        status: Option<u16>,
        /// Mapped response headers, keyed by metadata name.
        metadata: HashMap<String, Vec<u8>>,
    },
    /// Inbound bytes.
    Data {
        /// Payload.
        data: Vec<u8>,
        /// Completes a logical message.
        eom: bool,
    },
    /// Ready to accept the next payload.
    Writable,
    /// Reply to a validity ping.
    Pong,
    /// Peer closed the connection.
    Closed,
    /// Attempt failed or connection dropped.
    Failed(TransportError),
}

impl TransportEvent {
    /// `Connected` without response metadata.
    pub fn connected(status: Option<u16>) -> Self {
        Self::Connected {
            status,
            metadata: HashMap::new(),
        }
    }
}

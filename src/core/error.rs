//! Error types for Secure Streams.

use std::fmt;

use thiserror::Error;

use crate::session::StreamId;
use crate::system::ReadinessStage;

/// Kind of named policy entry, used in lookup and load errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A named retry / backoff strategy.
    RetryStrategy,
    /// A named certificate.
    Certificate,
    /// A named trust store.
    TrustStore,
    /// A named stream template.
    StreamType,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RetryStrategy => "retry strategy",
            Self::Certificate => "certificate",
            Self::TrustStore => "trust store",
            Self::StreamType => "stream type",
        };
        f.write_str(name)
    }
}

/// Errors raised while building, overlaying or resolving a policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Named entry does not exist.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Table that was searched.
        kind: EntryKind,
        /// Name that was looked up.
        name: String,
    },

    /// Two entries with the same name in one document.
    #[error("duplicate {kind}: {name}")]
    Duplicate {
        /// Table holding the collision.
        kind: EntryKind,
        /// Colliding name.
        name: String,
    },

    /// Retry strategy without any backoff delay.
    #[error("retry strategy {0} has an empty backoff table")]
    EmptyBackoff(String),

    /// Trust store references a certificate that is not in the table.
    #[error("trust store {store} references missing certificate {certificate}")]
    MissingCertificate {
        /// Trust store name.
        store: String,
        /// Missing certificate name.
        certificate: String,
    },

    /// Certificate material could not be decoded.
    #[error("invalid certificate {name}: {reason}")]
    InvalidCertificate {
        /// Certificate name.
        name: String,
        /// Decoder message.
        reason: String,
    },

    /// Policy document could not be parsed.
    #[error("policy parse error: {0}")]
    Parse(String),
}

impl PolicyError {
    /// Shorthand for a lookup failure.
    pub fn not_found(kind: EntryKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }
}

/// Errors in the system readiness state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    /// A notifier permanently refused a stage transition.
    #[error("transition to {stage:?} vetoed by {notifier}: {reason}")]
    Vetoed {
        /// Stage that could not be entered.
        stage: ReadinessStage,
        /// Name of the vetoing notifier.
        notifier: String,
        /// Reason given by the notifier.
        reason: String,
    },

    /// Only forward transitions can be requested.
    #[error("cannot move backwards from {current:?} to {target:?}")]
    Backwards {
        /// Current stage.
        current: ReadinessStage,
        /// Requested stage.
        target: ReadinessStage,
    },
}

/// Reasons a transport gives for a failed or dropped connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Host name did not resolve.
    #[error("dns resolution failed: {0}")]
    Dns(String),

    /// TCP connect failed or timed out.
    #[error("connect failed: {0}")]
    Connect(String),

    /// TLS negotiation or verification failed.
    #[error("tls failure: {0}")]
    Tls(String),

    /// Peer spoke something we could not parse.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Read or write error on an established connection.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Top-level Secure Streams errors.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Streams can only be created once the system is operational.
    #[error("system not operational (stage {0:?})")]
    NotOperational(ReadinessStage),

    /// Policy resolution error.
    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Readiness error (process-level).
    #[error("readiness error: {0}")]
    Readiness(#[from] ReadinessError),

    /// No session with this id.
    #[error("unknown stream: {0}")]
    UnknownStream(StreamId),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

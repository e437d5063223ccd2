//! The secure stream session state machine.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::handle::{StreamHandle, StreamId, StreamRequest};
use super::state::SessionState;
use crate::core::{
    DEFAULT_HTTP_SUCCESS, DEFAULT_SESSION_TIMEOUT, HTTP_REDIRECT, RxFlags, RxOutcome,
    SessionHandler, TransportError, TxOrdinal, TxOutcome,
};
use crate::policy::ResolvedStream;
use crate::retry::{FailureVerdict, RetryTracker};
use crate::transport::{ConnectRequest, ConnectionId, TransportEvent};

/// Why a connection attempt counted as failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    /// The transport reported an error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// HTTP status did not satisfy the template.
    #[error("unexpected http status {0}")]
    UnexpectedStatus(u16),

    /// Redirect on a template that treats redirects as failure.
    #[error("redirected with status {0}")]
    Redirected(u16),

    /// Peer closed before the connection came up.
    #[error("closed before connecting")]
    ClosedBeforeConnect,

    /// No inbound traffic within the validity hangup interval.
    #[error("validity hangup interval expired")]
    ValidityExpired,
}

/// Work the session asks the runtime to perform.
#[derive(Debug)]
pub enum SessionAction {
    /// Open a connection.
    Connect {
        /// Connection id for the attempt.
        conn: ConnectionId,
        /// What to connect to.
        request: ConnectRequest,
    },
    /// Write a payload.
    Send {
        /// Target connection.
        conn: ConnectionId,
        /// Bytes to write.
        payload: Vec<u8>,
        /// Transmit ordinal of the payload.
        ordinal: TxOrdinal,
        /// The handler has more to send.
        more: bool,
    },
    /// Issue a validity ping.
    Ping {
        /// Target connection.
        conn: ConnectionId,
    },
    /// Drop a connection.
    Disconnect {
        /// Target connection.
        conn: ConnectionId,
    },
}

/// Per-stream options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Absolute session timeout, armed when the session starts.
    pub timeout: Option<Duration>,
    /// Begin the first attempt as soon as the session starts.
    pub auto_connect: bool,
    /// Seed for the retry jitter generator.
    pub jitter_seed: Option<u64>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SESSION_TIMEOUT,
            auto_connect: true,
            jitter_seed: None,
        }
    }
}

impl StreamOptions {
    /// Set the absolute session timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Wait for an explicit connect request instead of connecting on start.
    pub fn manual_connect(mut self) -> Self {
        self.auto_connect = false;
        self
    }

    /// Make jitter reproducible.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Down,
    Connecting(ConnectionId),
    Up(ConnectionId),
}

impl Link {
    fn id(&self) -> Option<ConnectionId> {
        match self {
            Self::Down => None,
            Self::Connecting(conn) | Self::Up(conn) => Some(*conn),
        }
    }
}

/// One secure stream, bound to a resolved stream template.
///
/// The machine never performs I/O or reads the clock. Feed it with
/// [`handle_transport`](Self::handle_transport) and
/// [`handle_timeout`](Self::handle_timeout), wake it at
/// [`poll_timeout`](Self::poll_timeout), and drain
/// [`poll_action`](Self::poll_action) after every call.
pub struct SecureStream {
    id: StreamId,
    resolved: ResolvedStream,
    handler: Box<dyn SessionHandler>,
    options: StreamOptions,
    state: SessionState,
    tracker: RetryTracker,
    metadata: HashMap<String, Vec<u8>>,
    requests: Vec<StreamRequest>,
    actions: VecDeque<SessionAction>,
    link: Link,
    last_failure: Option<AttemptFailure>,
    last_attempt: Option<Instant>,
    retry_at: Option<Instant>,
    timeout_at: Option<Instant>,
    /// Last inbound traffic on the current connection.
    valid_since: Option<Instant>,
    ping_sent: bool,
    announce_attempt: bool,
    started: bool,
    closing: bool,
    terminal_reported: bool,
    tx_wanted: bool,
    tx_serving: bool,
    writable: bool,
    next_ordinal: TxOrdinal,
    acked: TxOrdinal,
    rx_som: bool,
}

impl SecureStream {
    /// Create a session. Nothing happens until [`start`](Self::start).
    pub fn new(
        id: StreamId,
        resolved: ResolvedStream,
        handler: Box<dyn SessionHandler>,
        options: StreamOptions,
    ) -> Self {
        let tracker = RetryTracker::new(resolved.retry.clone(), options.jitter_seed);
        Self {
            id,
            resolved,
            handler,
            options,
            state: SessionState::Creating,
            tracker,
            metadata: HashMap::new(),
            requests: Vec::new(),
            actions: VecDeque::new(),
            link: Link::Down,
            last_failure: None,
            last_attempt: None,
            retry_at: None,
            timeout_at: None,
            valid_since: None,
            ping_sent: false,
            announce_attempt: true,
            started: false,
            closing: false,
            terminal_reported: false,
            tx_wanted: false,
            tx_serving: false,
            writable: false,
            next_ordinal: 1,
            acked: 0,
            rx_som: true,
        }
    }

    /// Report `Creating`, arm the timeout and, unless disabled, begin the
    /// first attempt.
    pub fn start(&mut self, now: Instant) {
        if self.started {
            return;
        }
        self.started = true;

        if let Some(timeout) = self.options.timeout {
            self.timeout_at = Some(now + timeout);
        }
        debug!(
            stream = %self.id,
            stream_type = %self.resolved.template.name,
            retry = %self.resolved.retry.name,
            "session created"
        );

        self.report(SessionState::Creating, now);
        if self.options.auto_connect {
            self.connect_now(now);
        }
    }

    /// Stream id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Stream type name.
    pub fn stream_type(&self) -> &str {
        &self.resolved.template.name
    }

    /// Last reported state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.tracker.total_attempts()
    }

    /// When the latest attempt started.
    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    /// Why the latest attempt failed.
    pub fn last_failure(&self) -> Option<&AttemptFailure> {
        self.last_failure.as_ref()
    }

    /// Current connection, connecting or up.
    pub fn connection(&self) -> Option<ConnectionId> {
        self.link.id()
    }

    /// Whether the terminal state has been reported.
    pub fn is_finished(&self) -> bool {
        self.terminal_reported
    }

    /// Set a metadata value outside a callback.
    pub fn set_metadata(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.metadata.insert(name.into(), value.into());
    }

    /// Read a metadata value.
    pub fn metadata(&self, name: &str) -> Option<&[u8]> {
        self.metadata.get(name).map(Vec::as_slice)
    }

    /// Application request to connect now.
    pub fn request_connect(&mut self, now: Instant) {
        self.requests.push(StreamRequest::Connect);
        self.apply_requests(now);
    }

    /// Application request to close.
    pub fn request_close(&mut self, now: Instant) {
        self.requests.push(StreamRequest::Close);
        self.apply_requests(now);
    }

    /// Application request for a transmit callback.
    pub fn request_tx(&mut self, now: Instant) {
        self.requests.push(StreamRequest::RequestTx);
        self.apply_requests(now);
    }

    /// Next queued action.
    pub fn poll_action(&mut self) -> Option<SessionAction> {
        self.actions.pop_front()
    }

    /// Earliest instant at which [`handle_timeout`](Self::handle_timeout)
    /// has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.terminal_reported {
            return None;
        }
        let mut deadline = earliest(self.timeout_at, self.retry_at);
        if let (Link::Up(_), Some(since)) = (self.link, self.valid_since) {
            let strategy = &self.resolved.retry;
            deadline = earliest(deadline, strategy.valid_hangup().map(|hangup| since + hangup));
            if !self.ping_sent {
                deadline = earliest(deadline, strategy.valid_ping().map(|ping| since + ping));
            }
        }
        deadline
    }

    /// Fire whichever timers are due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.terminal_reported {
            return;
        }

        if self.timeout_at.is_some_and(|at| now >= at) {
            self.timeout_at = None;
            self.retry_at = None;
            if let Some(conn) = self.link.id() {
                self.actions.push_back(SessionAction::Disconnect { conn });
            }
            self.link = Link::Down;
            warn!(stream = %self.id, attempts = self.attempts(), "session timed out");
            self.report(SessionState::Timeout, now);
            return;
        }

        if self.retry_at.is_some_and(|at| now >= at) {
            self.retry_at = None;
            self.connect_now(now);
            return;
        }

        let Link::Up(conn) = self.link else {
            return;
        };
        let Some(since) = self.valid_since else {
            return;
        };
        let strategy = self.resolved.retry.clone();

        if strategy.valid_hangup().is_some_and(|hangup| now >= since + hangup) {
            warn!(stream = %self.id, %conn, "no valid traffic, hanging up");
            self.actions.push_back(SessionAction::Disconnect { conn });
            self.attempt_failed(AttemptFailure::ValidityExpired, now);
            return;
        }

        if !self.ping_sent && strategy.valid_ping().is_some_and(|ping| now >= since + ping) {
            debug!(stream = %self.id, %conn, "validity ping");
            self.ping_sent = true;
            self.actions.push_back(SessionAction::Ping { conn });
        }
    }

    /// Feed a transport event for `conn`.
    pub fn handle_transport(&mut self, conn: ConnectionId, event: TransportEvent, now: Instant) {
        if self.terminal_reported || self.link.id() != Some(conn) {
            trace!(stream = %self.id, %conn, "dropping stale transport event");
            return;
        }

        match event {
            TransportEvent::Connected { status, metadata } => {
                self.on_connected(conn, status, metadata, now)
            }
            TransportEvent::Data { data, eom } => self.on_data(&data, eom, now),
            TransportEvent::Writable => self.on_writable(now),
            TransportEvent::Pong => {
                if matches!(self.link, Link::Up(_)) {
                    self.valid_since = Some(now);
                    self.ping_sent = false;
                }
            }
            TransportEvent::Closed => match self.link {
                Link::Connecting(_) => self.attempt_failed(AttemptFailure::ClosedBeforeConnect, now),
                _ => {
                    debug!(stream = %self.id, %conn, "peer closed");
                    self.link = Link::Down;
                    self.close(now);
                }
            },
            TransportEvent::Failed(error) => {
                self.attempt_failed(AttemptFailure::Transport(error), now)
            }
        }
    }

    fn connect_now(&mut self, now: Instant) {
        if self.terminal_reported || self.closing || self.link != Link::Down {
            return;
        }
        self.retry_at = None;

        let attempt = self.tracker.on_attempt();
        let conn = ConnectionId::new(self.id, attempt);
        self.link = Link::Connecting(conn);
        self.last_attempt = Some(now);

        let template = &self.resolved.template;
        debug!(
            stream = %self.id,
            attempt,
            endpoint = %template.endpoint,
            port = template.port,
            protocol = %template.protocol,
            "connection attempt"
        );
        let request = self.connect_request();
        self.actions.push_back(SessionAction::Connect { conn, request });

        if std::mem::take(&mut self.announce_attempt) {
            self.report(SessionState::Connecting, now);
        }
    }

    fn connect_request(&self) -> ConnectRequest {
        let template = &self.resolved.template;
        ConnectRequest {
            endpoint: template.endpoint.clone(),
            port: template.port,
            protocol: template.protocol,
            tls: template.tls,
            http_method: template.http_method.clone(),
            http_url: template.http_url.clone(),
            trust: self.resolved.trust.clone(),
            metadata: self.metadata.clone(),
            metadata_headers: template.metadata_headers.clone(),
        }
    }

    fn on_connected(
        &mut self,
        conn: ConnectionId,
        status: Option<u16>,
        metadata: HashMap<String, Vec<u8>>,
        now: Instant,
    ) {
        if self.link != Link::Connecting(conn) {
            return;
        }

        if let Err(failure) = self.check_status(status) {
            self.actions.push_back(SessionAction::Disconnect { conn });
            self.attempt_failed(failure, now);
            return;
        }

        self.link = Link::Up(conn);
        self.tracker.on_success();
        self.valid_since = Some(now);
        self.ping_sent = false;
        self.writable = false;
        self.rx_som = true;
        self.metadata.extend(metadata);
        info!(stream = %self.id, %conn, status = ?status, "connected");

        self.report(SessionState::Connected, now);
    }

    fn check_status(&self, status: Option<u16>) -> Result<(), AttemptFailure> {
        let template = &self.resolved.template;
        let Some(status) = status else {
            return Ok(());
        };
        if !template.protocol.is_http() {
            return Ok(());
        }

        if template.http_fail_redirect && HTTP_REDIRECT.contains(&status) {
            return Err(AttemptFailure::Redirected(status));
        }
        match template.http_expect {
            Some(expected) if expected == status => Ok(()),
            Some(_) => Err(AttemptFailure::UnexpectedStatus(status)),
            None if template.opportunistic || DEFAULT_HTTP_SUCCESS.contains(&status) => Ok(()),
            None => Err(AttemptFailure::UnexpectedStatus(status)),
        }
    }

    fn attempt_failed(&mut self, failure: AttemptFailure, now: Instant) {
        self.link = Link::Down;
        self.valid_since = None;
        self.ping_sent = false;
        self.writable = false;

        let verdict = self.tracker.on_failure();
        let failures = self.tracker.consecutive_failures();
        match verdict {
            FailureVerdict::Retry {
                delay,
                visible,
                ..
            } => {
                if visible {
                    warn!(stream = %self.id, failures, ?delay, error = %failure, "attempt failed");
                } else {
                    debug!(stream = %self.id, failures, ?delay, error = %failure, "attempt failed (concealed)");
                }
                self.last_failure = Some(failure);
                self.retry_at = Some(now + delay);
                self.announce_attempt = visible;
                if visible {
                    self.report(SessionState::Retrying, now);
                }
            }
            FailureVerdict::Exhausted => {
                warn!(stream = %self.id, failures, error = %failure, "retries exhausted");
                self.last_failure = Some(failure);
                self.report(SessionState::AllRetriesFailed, now);
            }
        }
    }

    fn on_data(&mut self, data: &[u8], eom: bool, now: Instant) {
        if !matches!(self.link, Link::Up(_)) {
            return;
        }
        self.valid_since = Some(now);
        self.ping_sent = false;

        self.mark_active(now);
        if self.terminal_reported || self.closing {
            return;
        }

        let flags = RxFlags {
            som: self.rx_som,
            eom,
        };
        self.rx_som = eom;
        let outcome = self.callback(|handler, stream| handler.on_receive(stream, data, flags));
        self.apply_requests(now);
        if self.terminal_reported || self.closing {
            return;
        }

        match outcome {
            RxOutcome::Close => self.close(now),
            RxOutcome::Continue if eom && self.state == SessionState::Active => {
                self.report(SessionState::Idle, now)
            }
            RxOutcome::Continue => {}
        }
    }

    fn on_writable(&mut self, now: Instant) {
        if !matches!(self.link, Link::Up(_)) {
            return;
        }
        self.acked = self.next_ordinal.wrapping_sub(1);
        self.writable = true;
        self.service_tx(now);
    }

    fn service_tx(&mut self, now: Instant) {
        let Link::Up(conn) = self.link else {
            return;
        };
        if self.tx_serving || !self.tx_wanted || !self.writable {
            return;
        }
        self.tx_wanted = false;
        self.tx_serving = true;

        let ordinal = self.next_ordinal;
        let outcome = self.callback(|handler, stream| handler.on_transmit_request(stream, ordinal));
        if let TxOutcome::Send {
            payload,
            more_pending,
        } = outcome
        {
            trace!(stream = %self.id, ordinal, len = payload.len(), more_pending, "transmit");
            self.next_ordinal = self.next_ordinal.wrapping_add(1);
            self.writable = false;
            self.tx_wanted |= more_pending;
            self.actions.push_back(SessionAction::Send {
                conn,
                payload,
                ordinal,
                more: more_pending,
            });
        }
        self.tx_serving = false;

        if self.next_ordinal != ordinal {
            self.mark_active(now);
        }
        self.apply_requests(now);
    }

    fn mark_active(&mut self, now: Instant) {
        if matches!(self.state, SessionState::Connected | SessionState::Idle) {
            self.report(SessionState::Active, now);
        }
    }

    fn close(&mut self, now: Instant) {
        if self.closing || self.terminal_reported {
            return;
        }
        self.closing = true;
        self.retry_at = None;
        self.timeout_at = None;
        if let Some(conn) = self.link.id() {
            self.actions.push_back(SessionAction::Disconnect { conn });
        }
        self.link = Link::Down;

        self.report(SessionState::Disconnecting, now);
        self.report(SessionState::Destroyed, now);
    }

    fn report(&mut self, state: SessionState, now: Instant) {
        if self.terminal_reported {
            return;
        }
        let previous = self.state;
        self.state = state;
        if state.is_terminal() {
            self.terminal_reported = true;
            self.retry_at = None;
            self.timeout_at = None;
        }
        debug!(stream = %self.id, from = %previous, to = %state, "session state");

        let ack = self.acked;
        self.callback(|handler, stream| handler.on_state_change(stream, state, ack));
        self.apply_requests(now);
    }

    fn apply_requests(&mut self, now: Instant) {
        while !self.requests.is_empty() {
            let pending = std::mem::take(&mut self.requests);
            for request in pending {
                if self.terminal_reported {
                    self.requests.clear();
                    return;
                }
                match request {
                    StreamRequest::Connect => self.connect_now(now),
                    StreamRequest::Close => self.close(now),
                    StreamRequest::RequestTx => {
                        self.tx_wanted = true;
                        self.service_tx(now);
                    }
                    StreamRequest::StartTimeout(timeout) => self.timeout_at = Some(now + timeout),
                    StreamRequest::CancelTimeout => self.timeout_at = None,
                }
            }
        }
    }

    fn callback<R>(
        &mut self,
        f: impl FnOnce(&mut Box<dyn SessionHandler>, &mut StreamHandle<'_>) -> R,
    ) -> R {
        let mut handle = StreamHandle {
            id: self.id,
            stream_type: &self.resolved.template.name,
            state: self.state,
            metadata: &mut self.metadata,
            requests: &mut self.requests,
            last_failure: self.last_failure.as_ref(),
        };
        f(&mut self.handler, &mut handle)
    }
}

impl std::fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream")
            .field("id", &self.id)
            .field("stream_type", &self.resolved.template.name)
            .field("state", &self.state)
            .field("attempts", &self.tracker.total_attempts())
            .finish_non_exhaustive()
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::policy::{Policy, RetryStrategy, StreamProtocol, StreamTemplate};

    type Log = Rc<RefCell<Vec<(SessionState, TxOrdinal)>>>;

    #[derive(Default)]
    struct Recorder {
        log: Log,
        received: Rc<RefCell<Vec<(Vec<u8>, RxFlags)>>>,
        rx_outcome: Option<RxOutcome>,
        payloads: VecDeque<Vec<u8>>,
        tx_on_connect: bool,
        timeout_on_create: Option<Duration>,
        read_metadata: Vec<&'static str>,
        metadata_seen: Rc<RefCell<Vec<Option<Vec<u8>>>>>,
    }

    impl SessionHandler for Recorder {
        fn on_receive(
            &mut self,
            stream: &mut StreamHandle<'_>,
            data: &[u8],
            flags: RxFlags,
        ) -> RxOutcome {
            for name in &self.read_metadata {
                let value = stream.metadata(name).map(<[u8]>::to_vec);
                self.metadata_seen.borrow_mut().push(value);
            }
            self.received.borrow_mut().push((data.to_vec(), flags));
            self.rx_outcome.unwrap_or(RxOutcome::Continue)
        }

        fn on_transmit_request(
            &mut self,
            _stream: &mut StreamHandle<'_>,
            _ordinal: TxOrdinal,
        ) -> TxOutcome {
            match self.payloads.pop_front() {
                Some(payload) => TxOutcome::Send {
                    payload,
                    more_pending: !self.payloads.is_empty(),
                },
                None => TxOutcome::Decline,
            }
        }

        fn on_state_change(
            &mut self,
            stream: &mut StreamHandle<'_>,
            state: SessionState,
            ack: TxOrdinal,
        ) {
            self.log.borrow_mut().push((state, ack));
            match state {
                SessionState::Creating => {
                    if let Some(timeout) = self.timeout_on_create {
                        stream.start_timeout(timeout);
                    }
                }
                SessionState::Connected if self.tx_on_connect => stream.request_tx(),
                _ => {}
            }
        }
    }

    fn states(log: &Log) -> Vec<SessionState> {
        log.borrow().iter().map(|(state, _)| *state).collect()
    }

    fn raw_template() -> StreamTemplate {
        StreamTemplate::new("echo", "127.0.0.1", 7, StreamProtocol::Raw)
    }

    fn http_template() -> StreamTemplate {
        StreamTemplate::new("probe", "example.com", 80, StreamProtocol::H1).with_http("GET", "/")
    }

    fn resolved(template: StreamTemplate, strategy: Option<RetryStrategy>) -> ResolvedStream {
        let name = template.name.clone();
        let mut builder = Policy::builder();
        let template = match strategy {
            Some(strategy) => {
                let template = template.with_retry(strategy.name.clone());
                builder = builder.retry(strategy).unwrap();
                template
            }
            None => template,
        };
        builder
            .stream(template)
            .unwrap()
            .build()
            .unwrap()
            .resolve_stream(&name)
            .unwrap()
    }

    fn session(resolved: ResolvedStream, recorder: Recorder, options: StreamOptions) -> SecureStream {
        SecureStream::new(
            StreamId(1),
            resolved,
            Box::new(recorder),
            options.with_jitter_seed(1),
        )
    }

    fn drain(stream: &mut SecureStream) -> Vec<SessionAction> {
        std::iter::from_fn(|| stream.poll_action()).collect()
    }

    fn expect_connect(stream: &mut SecureStream) -> ConnectionId {
        match drain(stream).as_slice() {
            [SessionAction::Connect { conn, .. }] => *conn,
            other => panic!("expected a single connect, got {other:?}"),
        }
    }

    fn refused() -> TransportEvent {
        TransportEvent::Failed(TransportError::Connect("refused".into()))
    }

    fn default_strategy() -> RetryStrategy {
        RetryStrategy::new("default", vec![1000, 2000, 3000, 5000, 10000]).unwrap()
    }

    #[test]
    fn test_concealed_failures_then_connected() {
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let mut stream = session(
            resolved(raw_template(), Some(default_strategy().with_conceal(5))),
            recorder,
            StreamOptions::default(),
        );

        let mut now = Instant::now();
        stream.start(now);

        let expected_waits = [1000, 2000, 3000, 5000, 10000];
        for (index, wait) in expected_waits.iter().enumerate() {
            let conn = expect_connect(&mut stream);
            assert_eq!(conn.attempt, index as u32 + 1);

            stream.handle_transport(conn, refused(), now);
            let deadline = stream.poll_timeout().unwrap();
            assert_eq!(deadline - now, Duration::from_millis(*wait));

            now = deadline;
            stream.handle_timeout(now);
        }

        let conn = expect_connect(&mut stream);
        stream.handle_transport(conn, TransportEvent::connected(None), now);

        assert_eq!(
            states(&log),
            vec![
                SessionState::Creating,
                SessionState::Connecting,
                SessionState::Connected
            ]
        );
        assert_eq!(stream.attempts(), 6);
    }

    #[test]
    fn test_first_visible_failure_after_conceal() {
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let mut stream = session(
            resolved(raw_template(), Some(default_strategy().with_conceal(5))),
            recorder,
            StreamOptions::default(),
        );

        let mut now = Instant::now();
        stream.start(now);
        for _ in 0..5 {
            let conn = expect_connect(&mut stream);
            stream.handle_transport(conn, refused(), now);
            now = stream.poll_timeout().unwrap();
            stream.handle_timeout(now);
        }
        assert_eq!(
            states(&log),
            vec![SessionState::Creating, SessionState::Connecting]
        );

        let conn = expect_connect(&mut stream);
        stream.handle_transport(conn, refused(), now);
        assert_eq!(states(&log).last(), Some(&SessionState::Retrying));
        assert!(matches!(
            stream.last_failure(),
            Some(AttemptFailure::Transport(TransportError::Connect(_)))
        ));

        now = stream.poll_timeout().unwrap();
        stream.handle_timeout(now);
        let conn = expect_connect(&mut stream);
        assert_eq!(conn.attempt, 7);
        assert_eq!(states(&log).last(), Some(&SessionState::Connecting));

        stream.handle_transport(conn, TransportEvent::connected(None), now);
        assert_eq!(
            states(&log),
            vec![
                SessionState::Creating,
                SessionState::Connecting,
                SessionState::Retrying,
                SessionState::Connecting,
                SessionState::Connected
            ]
        );
        assert!(!states(&log).contains(&SessionState::AllRetriesFailed));
        assert_eq!(stream.attempts(), 7);
        assert_eq!(stream.state(), SessionState::Connected);
    }

    #[test]
    fn test_timeout_cancels_retry_timer() {
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let strategy = RetryStrategy::new("slow", vec![5000]).unwrap();
        let mut stream = session(
            resolved(raw_template(), Some(strategy)),
            recorder,
            StreamOptions::default().with_timeout(Duration::from_millis(3000)),
        );

        let start = Instant::now();
        stream.start(start);
        let conn = expect_connect(&mut stream);
        stream.handle_transport(conn, refused(), start);

        assert_eq!(stream.poll_timeout(), Some(start + Duration::from_millis(3000)));
        stream.handle_timeout(start + Duration::from_millis(3000));

        assert_eq!(states(&log).last(), Some(&SessionState::Timeout));
        assert_eq!(stream.poll_timeout(), None);
        assert!(drain(&mut stream).is_empty());

        // The retry instant passes without a new attempt.
        stream.handle_timeout(start + Duration::from_millis(5000));
        assert!(drain(&mut stream).is_empty());
        assert_eq!(stream.attempts(), 1);
    }

    #[test]
    fn test_timeout_while_connecting_disconnects() {
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let mut stream = session(
            resolved(raw_template(), Some(default_strategy())),
            recorder,
            StreamOptions::default().with_timeout(Duration::from_millis(3000)),
        );

        let start = Instant::now();
        stream.start(start);
        let conn = expect_connect(&mut stream);
        stream.handle_timeout(start + Duration::from_millis(3000));

        assert!(matches!(
            drain(&mut stream).as_slice(),
            [SessionAction::Disconnect { conn: closed }] if *closed == conn
        ));
        assert_eq!(
            states(&log),
            vec![
                SessionState::Creating,
                SessionState::Connecting,
                SessionState::Timeout
            ]
        );

        // A late connect for the cancelled attempt is ignored.
        stream.handle_transport(conn, TransportEvent::connected(None), start);
        assert_eq!(states(&log).len(), 3);
    }

    #[test]
    fn test_retry_cap_reports_all_retries_failed_once() {
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let strategy = RetryStrategy::new("capped", vec![100]).unwrap().with_limit(2);
        let mut stream = session(
            resolved(raw_template(), Some(strategy)),
            recorder,
            StreamOptions::default(),
        );

        let mut now = Instant::now();
        stream.start(now);
        for _ in 0..2 {
            let conn = expect_connect(&mut stream);
            stream.handle_transport(conn, refused(), now);
            now = stream.poll_timeout().unwrap();
            stream.handle_timeout(now);
        }
        let conn = expect_connect(&mut stream);
        stream.handle_transport(conn, refused(), now);

        assert_eq!(stream.attempts(), 3);
        assert!(stream.is_finished());
        assert_eq!(stream.poll_timeout(), None);
        assert!(drain(&mut stream).is_empty());

        // Nothing after the terminal state.
        stream.request_close(now);
        stream.request_connect(now);
        stream.handle_timeout(now + Duration::from_secs(60));
        let terminal: Vec<_> = states(&log)
            .into_iter()
            .filter(SessionState::is_terminal)
            .collect();
        assert_eq!(terminal, vec![SessionState::AllRetriesFailed]);
        assert!(drain(&mut stream).is_empty());
    }

    #[test]
    fn test_close_cancels_pending_retry() {
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let mut stream = session(
            resolved(raw_template(), Some(default_strategy())),
            recorder,
            StreamOptions::default(),
        );

        let now = Instant::now();
        stream.start(now);
        let conn = expect_connect(&mut stream);
        stream.handle_transport(conn, refused(), now);
        assert!(stream.poll_timeout().is_some());

        stream.request_close(now);
        assert_eq!(
            states(&log),
            vec![
                SessionState::Creating,
                SessionState::Connecting,
                SessionState::Retrying,
                SessionState::Disconnecting,
                SessionState::Destroyed
            ]
        );
        assert_eq!(stream.poll_timeout(), None);
        stream.handle_timeout(now + Duration::from_secs(2));
        assert!(drain(&mut stream).is_empty());
    }

    #[test]
    fn test_unexpected_status_fails_attempt() {
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let mut stream = session(
            resolved(http_template().with_expect(204), None),
            recorder,
            StreamOptions::default(),
        );

        let now = Instant::now();
        stream.start(now);
        let conn = expect_connect(&mut stream);
        stream.handle_transport(conn, TransportEvent::connected(Some(200)), now);

        assert!(matches!(
            drain(&mut stream).as_slice(),
            [SessionAction::Disconnect { .. }]
        ));
        assert_eq!(stream.last_failure(), Some(&AttemptFailure::UnexpectedStatus(200)));
        assert_eq!(
            states(&log),
            vec![
                SessionState::Creating,
                SessionState::Connecting,
                SessionState::AllRetriesFailed
            ]
        );
    }

    #[test]
    fn test_redirect_fails_before_expectation() {
        let mut stream = session(
            resolved(http_template().with_expect(302).fail_on_redirect(), None),
            Recorder::default(),
            StreamOptions::default(),
        );

        let now = Instant::now();
        stream.start(now);
        let conn = expect_connect(&mut stream);
        stream.handle_transport(conn, TransportEvent::connected(Some(302)), now);
        assert_eq!(stream.last_failure(), Some(&AttemptFailure::Redirected(302)));
        assert_eq!(stream.state(), SessionState::AllRetriesFailed);
    }

    #[test]
    fn test_status_defaults() {
        for (template, status, connected) in [
            (http_template(), 204, true),
            (http_template(), 500, false),
            (http_template().opportunistic(), 500, true),
            (http_template().fail_on_redirect().opportunistic(), 301, false),
        ] {
            let mut stream = session(resolved(template, None), Recorder::default(), StreamOptions::default());
            let now = Instant::now();
            stream.start(now);
            let conn = expect_connect(&mut stream);
            stream.handle_transport(conn, TransportEvent::connected(Some(status)), now);
            assert_eq!(stream.state() == SessionState::Connected, connected, "status {status}");
        }
    }

    #[test]
    fn test_receive_active_idle_and_peer_close() {
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let received = recorder.received.clone();
        let mut stream = session(resolved(raw_template(), None), recorder, StreamOptions::default());

        let now = Instant::now();
        stream.start(now);
        let conn = expect_connect(&mut stream);
        stream.handle_transport(conn, TransportEvent::connected(None), now);
        stream.handle_transport(conn, TransportEvent::Data { data: b"he".to_vec(), eom: false }, now);
        stream.handle_transport(conn, TransportEvent::Data { data: b"llo".to_vec(), eom: true }, now);
        stream.handle_transport(conn, TransportEvent::Data { data: b"again".to_vec(), eom: false }, now);

        assert_eq!(
            *received.borrow(),
            vec![
                (b"he".to_vec(), RxFlags { som: true, eom: false }),
                (b"llo".to_vec(), RxFlags { som: false, eom: true }),
                (b"again".to_vec(), RxFlags { som: true, eom: false }),
            ]
        );

        stream.handle_transport(conn, TransportEvent::Closed, now);
        assert_eq!(
            states(&log),
            vec![
                SessionState::Creating,
                SessionState::Connecting,
                SessionState::Connected,
                SessionState::Active,
                SessionState::Idle,
                SessionState::Active,
                SessionState::Disconnecting,
                SessionState::Destroyed
            ]
        );
        // Peer already closed; nothing to disconnect.
        assert!(drain(&mut stream).is_empty());
    }

    #[test]
    fn test_receive_close_outcome_closes_session() {
        let recorder = Recorder {
            rx_outcome: Some(RxOutcome::Close),
            ..Recorder::default()
        };
        let log = recorder.log.clone();
        let mut stream = session(resolved(http_template(), None), recorder, StreamOptions::default());

        let now = Instant::now();
        stream.start(now);
        let conn = expect_connect(&mut stream);
        stream.handle_transport(conn, TransportEvent::connected(Some(200)), now);
        stream.handle_transport(conn, TransportEvent::Data { data: b"{}".to_vec(), eom: true }, now);

        assert!(matches!(
            drain(&mut stream).as_slice(),
            [SessionAction::Disconnect { conn: closed }] if *closed == conn
        ));
        assert_eq!(states(&log).last(), Some(&SessionState::Destroyed));
        assert!(stream.is_finished());
    }

    #[test]
    fn test_transmit_on_writable() {
        let recorder = Recorder {
            payloads: VecDeque::from([b"hello".to_vec(), b"world".to_vec()]),
            tx_on_connect: true,
            ..Recorder::default()
        };
        let log = recorder.log.clone();
        let mut stream = session(resolved(raw_template(), None), recorder, StreamOptions::default());

        let now = Instant::now();
        stream.start(now);
        let conn = expect_connect(&mut stream);
        stream.handle_transport(conn, TransportEvent::connected(None), now);
        assert!(drain(&mut stream).is_empty());

        stream.handle_transport(conn, TransportEvent::Writable, now);
        match drain(&mut stream).as_slice() {
            [SessionAction::Send { payload, ordinal, more, .. }] => {
                assert_eq!(payload, b"hello");
                assert_eq!(*ordinal, 1);
                assert!(*more);
            }
            other => panic!("unexpected actions {other:?}"),
        }
        assert_eq!(stream.state(), SessionState::Active);

        stream.handle_transport(conn, TransportEvent::Writable, now);
        assert!(matches!(
            drain(&mut stream).as_slice(),
            [SessionAction::Send { ordinal: 2, more: false, .. }]
        ));

        stream.handle_transport(conn, TransportEvent::Writable, now);
        assert!(drain(&mut stream).is_empty());

        stream.request_close(now);
        assert_eq!(log.borrow().last(), Some(&(SessionState::Destroyed, 2)));
    }

    #[test]
    fn test_validity_ping_then_hangup() {
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let strategy = default_strategy().with_validity(30, 35);
        let mut stream = session(resolved(raw_template(), Some(strategy)), recorder, StreamOptions::default());

        let start = Instant::now();
        stream.start(start);
        let conn = expect_connect(&mut stream);
        stream.handle_transport(conn, TransportEvent::connected(None), start);

        let ping_at = stream.poll_timeout().unwrap();
        assert_eq!(ping_at - start, Duration::from_secs(30));
        stream.handle_timeout(ping_at);
        assert!(matches!(drain(&mut stream).as_slice(), [SessionAction::Ping { .. }]));

        let hangup_at = stream.poll_timeout().unwrap();
        assert_eq!(hangup_at - start, Duration::from_secs(35));
        stream.handle_timeout(hangup_at);
        assert!(matches!(
            drain(&mut stream).as_slice(),
            [SessionAction::Disconnect { .. }]
        ));
        assert_eq!(stream.last_failure(), Some(&AttemptFailure::ValidityExpired));
        assert_eq!(states(&log).last(), Some(&SessionState::Retrying));
    }

    #[test]
    fn test_pong_extends_validity() {
        let strategy = default_strategy().with_validity(30, 35);
        let mut stream = session(
            resolved(raw_template(), Some(strategy)),
            Recorder::default(),
            StreamOptions::default(),
        );

        let start = Instant::now();
        stream.start(start);
        let conn = expect_connect(&mut stream);
        stream.handle_transport(conn, TransportEvent::connected(None), start);

        let ping_at = start + Duration::from_secs(30);
        stream.handle_timeout(ping_at);
        drain(&mut stream);
        stream.handle_transport(conn, TransportEvent::Pong, ping_at);

        assert_eq!(stream.poll_timeout(), Some(ping_at + Duration::from_secs(30)));
        assert_eq!(stream.state(), SessionState::Connected);
    }

    #[test]
    fn test_handler_arms_timeout_while_creating() {
        let recorder = Recorder {
            timeout_on_create: Some(Duration::from_secs(3)),
            ..Recorder::default()
        };
        let mut stream = session(resolved(raw_template(), None), recorder, StreamOptions::default());

        let start = Instant::now();
        stream.start(start);
        assert_eq!(stream.poll_timeout(), Some(start + Duration::from_secs(3)));
    }

    #[test]
    fn test_manual_connect_and_stale_events() {
        let recorder = Recorder::default();
        let log = recorder.log.clone();
        let mut stream = session(
            resolved(raw_template(), Some(default_strategy())),
            recorder,
            StreamOptions::default().manual_connect(),
        );

        let now = Instant::now();
        stream.start(now);
        assert!(drain(&mut stream).is_empty());

        stream.request_connect(now);
        let first = expect_connect(&mut stream);
        stream.handle_transport(first, refused(), now);

        // Explicit connect skips the backoff wait.
        stream.request_connect(now);
        let second = expect_connect(&mut stream);
        assert_eq!(second.attempt, 2);

        stream.handle_transport(first, TransportEvent::connected(None), now);
        assert_ne!(stream.state(), SessionState::Connected);

        stream.handle_transport(second, TransportEvent::connected(None), now);
        assert_eq!(states(&log).last(), Some(&SessionState::Connected));
    }

    #[test]
    fn test_metadata_reaches_connect_request() {
        let mut stream = session(resolved(raw_template(), None), Recorder::default(), StreamOptions::default().manual_connect());
        let now = Instant::now();
        stream.start(now);
        stream.set_metadata("x-token", b"abc".to_vec());
        stream.request_connect(now);

        match drain(&mut stream).as_slice() {
            [SessionAction::Connect { request, .. }] => {
                assert_eq!(request.metadata.get("x-token").map(Vec::as_slice), Some(&b"abc"[..]));
                assert_eq!(request.port, 7);
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn test_mapped_response_headers_readable_on_receive() {
        let recorder = Recorder {
            read_metadata: vec!["srv", "test"],
            ..Recorder::default()
        };
        let seen = recorder.metadata_seen.clone();
        let template = http_template()
            .with_metadata_header("srv", "server:")
            .with_metadata_header("test", "x-test:");
        let mut stream = session(resolved(template, None), recorder, StreamOptions::default());

        let now = Instant::now();
        stream.start(now);
        let conn = match drain(&mut stream).as_slice() {
            [SessionAction::Connect { conn, request }] => {
                assert_eq!(request.metadata_headers.get("srv").map(String::as_str), Some("server"));
                *conn
            }
            other => panic!("expected a single connect, got {other:?}"),
        };

        let metadata = HashMap::from([("srv".to_string(), b"lwsws".to_vec())]);
        stream.handle_transport(
            conn,
            TransportEvent::Connected {
                status: Some(200),
                metadata,
            },
            now,
        );
        stream.handle_transport(
            conn,
            TransportEvent::Data {
                data: b"hello".to_vec(),
                eom: true,
            },
            now,
        );

        assert_eq!(*seen.borrow(), vec![Some(b"lwsws".to_vec()), None]);
        assert_eq!(stream.metadata("srv"), Some(&b"lwsws"[..]));
    }
}

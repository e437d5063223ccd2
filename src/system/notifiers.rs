//! Built-in readiness notifiers.
//!
//! - [`CaptivePortalNotifier`] holds `CaptivePortalCheck -> TimeValid` until
//!   the `captive_portal_detect` probe has finished.
//! - [`PolicyFetchNotifier`] holds `TimeValid -> PolicyValid` until the
//!   `fetch_policy` stream has delivered a document and it has been laid over
//!   the current policy.
//! - [`CredentialNotifier`] holds a step until a root token is in the blob
//!   store.
//! - [`OverlayNotifier`] applies a fixed policy fragment on arrival at a
//!   stage.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::blob::{BlobKey, BlobStore};
use super::readiness::{NotifyContext, Notification, ReadinessNotifier, ReadinessStage, ResumeHandle};
use crate::core::{
    CAPTIVE_PORTAL_STREAM, FETCH_POLICY_STREAM, MAX_POLICY_DOCUMENT_SIZE, RxFlags, RxOutcome,
    SessionHandler, TxOrdinal,
};
use crate::policy::{Policy, PolicyHandle, PolicyLoader};
use crate::session::{AttemptFailure, SessionState, StreamHandle, StreamOptions};

// =============================================================================
// CAPTIVE PORTAL
// =============================================================================

/// Result of the captive portal probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptivePortalStatus {
    /// No probe has finished.
    #[default]
    Unknown,
    /// The probe got the expected answer.
    Clear,
    /// The probe was answered by something else (redirect or wrong status).
    BehindPortal,
    /// The probe could not reach anything.
    NoInternet,
}

impl fmt::Display for CaptivePortalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Clear => "clear",
            Self::BehindPortal => "behind captive portal",
            Self::NoInternet => "no internet",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct ProbeShared {
    status: Cell<CaptivePortalStatus>,
    running: Cell<bool>,
    generation: Cell<u32>,
}

/// Read-only view of the probe result.
#[derive(Debug, Clone)]
pub struct CaptivePortalMonitor {
    shared: Rc<ProbeShared>,
}

impl CaptivePortalMonitor {
    /// Latest probe result.
    pub fn status(&self) -> CaptivePortalStatus {
        self.shared.status.get()
    }
}

/// Gates time validation on the captive portal probe.
///
/// A non-clear result vetoes the step unless the probe template is
/// opportunistic. Without a probe template the step proceeds.
#[derive(Debug, Default)]
pub struct CaptivePortalNotifier {
    shared: Rc<ProbeShared>,
    options: StreamOptions,
}

impl CaptivePortalNotifier {
    /// Create the notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the probe with an absolute timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_timeout(timeout);
        self
    }

    /// A view of the probe result that stays valid across teardowns.
    pub fn monitor(&self) -> CaptivePortalMonitor {
        CaptivePortalMonitor {
            shared: self.shared.clone(),
        }
    }
}

impl ReadinessNotifier for CaptivePortalNotifier {
    fn name(&self) -> &str {
        "captive-portal"
    }

    fn notify(
        &mut self,
        cx: &mut NotifyContext<'_>,
        current: ReadinessStage,
        target: ReadinessStage,
    ) -> Notification {
        if current != ReadinessStage::CaptivePortalCheck || target != ReadinessStage::TimeValid {
            return Notification::Proceed;
        }

        let policy = cx.policy().load();
        let Ok(template) = policy.resolve_stream_template(CAPTIVE_PORTAL_STREAM) else {
            debug!("no captive portal probe configured");
            return Notification::Proceed;
        };

        match self.shared.status.get() {
            CaptivePortalStatus::Unknown => {
                if self.shared.running.get() {
                    return Notification::Pending;
                }
                if let Err(error) = policy.resolve_stream(CAPTIVE_PORTAL_STREAM) {
                    return if template.opportunistic {
                        warn!(%error, "captive portal probe unusable, continuing");
                        Notification::Proceed
                    } else {
                        Notification::Veto(format!("captive portal probe: {error}"))
                    };
                }

                info!(endpoint = %template.endpoint, "starting captive portal probe");
                self.shared.running.set(true);
                let probe = CaptivePortalProbe {
                    shared: self.shared.clone(),
                    generation: self.shared.generation.get(),
                    resume: cx.resume_handle(),
                };
                cx.spawn_stream(CAPTIVE_PORTAL_STREAM, Box::new(probe), self.options.clone());
                Notification::Pending
            }
            CaptivePortalStatus::Clear => Notification::Proceed,
            status if template.opportunistic => {
                warn!(%status, "captive portal check failed, continuing");
                Notification::Proceed
            }
            status => Notification::Veto(format!("captive portal check: {status}")),
        }
    }

    fn on_teardown(&mut self) {
        self.shared.generation.set(self.shared.generation.get().wrapping_add(1));
        self.shared.status.set(CaptivePortalStatus::Unknown);
        self.shared.running.set(false);
    }
}

struct CaptivePortalProbe {
    shared: Rc<ProbeShared>,
    generation: u32,
    resume: ResumeHandle,
}

impl CaptivePortalProbe {
    fn current(&self) -> bool {
        self.shared.generation.get() == self.generation
    }
}

impl SessionHandler for CaptivePortalProbe {
    fn on_receive(&mut self, _: &mut StreamHandle<'_>, _: &[u8], _: RxFlags) -> RxOutcome {
        RxOutcome::Close
    }

    fn on_state_change(&mut self, stream: &mut StreamHandle<'_>, state: SessionState, _: TxOrdinal) {
        if !self.current() {
            return;
        }

        match state {
            SessionState::Connected => {
                self.shared.status.set(CaptivePortalStatus::Clear);
                stream.close();
            }
            SessionState::AllRetriesFailed | SessionState::Timeout => {
                let status = match stream.last_failure() {
                    Some(AttemptFailure::Redirected(_) | AttemptFailure::UnexpectedStatus(_)) => {
                        CaptivePortalStatus::BehindPortal
                    }
                    _ => CaptivePortalStatus::NoInternet,
                };
                self.shared.status.set(status);
            }
            _ => {}
        }

        if state.is_terminal() {
            if self.shared.status.get() == CaptivePortalStatus::Unknown {
                self.shared.status.set(CaptivePortalStatus::NoInternet);
            }
            info!(status = %self.shared.status.get(), "captive portal probe finished");
            self.shared.running.set(false);
            self.resume.resume();
        }
    }
}

// =============================================================================
// POLICY FETCH
// =============================================================================

#[derive(Debug, Default)]
enum FetchState {
    #[default]
    Idle,
    Running,
    Fetched(Vec<u8>),
    Failed(String),
    Applied,
}

#[derive(Debug, Default)]
struct FetchShared {
    state: RefCell<FetchState>,
    generation: Cell<u32>,
}

/// Fetches a policy document and lays it over the current policy before
/// the policy is declared valid.
///
/// Failure vetoes the step unless the `fetch_policy` template is
/// opportunistic. Without a `fetch_policy` template the step proceeds.
pub struct PolicyFetchNotifier {
    loader: Box<dyn PolicyLoader>,
    shared: Rc<FetchShared>,
    max_size: usize,
    options: StreamOptions,
}

impl PolicyFetchNotifier {
    /// Create the notifier with the loader used to parse the document.
    pub fn new(loader: impl PolicyLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            shared: Rc::default(),
            max_size: MAX_POLICY_DOCUMENT_SIZE,
            options: StreamOptions::default(),
        }
    }

    /// Limit the accepted document size.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Bound the fetch with an absolute timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.options = self.options.with_timeout(timeout);
        self
    }

    fn apply(&self, policy: &PolicyHandle, document: &[u8]) -> Result<(), String> {
        let text = std::str::from_utf8(document).map_err(|e| format!("document is not utf-8: {e}"))?;
        let merged = policy
            .overlay_with(|base| self.loader.overlay(base, text))
            .map_err(|e| e.to_string())?;
        info!(
            release = merged.release.as_deref().unwrap_or("-"),
            bytes = document.len(),
            "fetched policy applied"
        );
        Ok(())
    }

    fn failed(opportunistic: bool, reason: &str) -> Notification {
        if opportunistic {
            warn!(%reason, "policy fetch failed, continuing with built-in policy");
            Notification::Proceed
        } else {
            Notification::Veto(format!("policy fetch failed: {reason}"))
        }
    }
}

impl fmt::Debug for PolicyFetchNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyFetchNotifier")
            .field("state", &self.shared.state)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl ReadinessNotifier for PolicyFetchNotifier {
    fn name(&self) -> &str {
        "policy-fetch"
    }

    fn notify(
        &mut self,
        cx: &mut NotifyContext<'_>,
        current: ReadinessStage,
        target: ReadinessStage,
    ) -> Notification {
        if current != ReadinessStage::TimeValid || target != ReadinessStage::PolicyValid {
            return Notification::Proceed;
        }

        let policy = cx.policy().load();
        let Ok(template) = policy.resolve_stream_template(FETCH_POLICY_STREAM) else {
            debug!("no policy fetch configured");
            return Notification::Proceed;
        };

        let (next, answer) = match self.shared.state.take() {
            FetchState::Idle => match policy.resolve_stream(FETCH_POLICY_STREAM) {
                Ok(_) => {
                    info!(endpoint = %template.endpoint, "fetching policy");
                    let fetch = PolicyFetch {
                        shared: self.shared.clone(),
                        generation: self.shared.generation.get(),
                        body: Vec::new(),
                        max_size: self.max_size,
                        resume: cx.resume_handle(),
                    };
                    cx.spawn_stream(FETCH_POLICY_STREAM, Box::new(fetch), self.options.clone());
                    (FetchState::Running, Notification::Pending)
                }
                Err(error) => {
                    let reason = error.to_string();
                    let answer = Self::failed(template.opportunistic, &reason);
                    (FetchState::Failed(reason), answer)
                }
            },
            FetchState::Running => (FetchState::Running, Notification::Pending),
            FetchState::Fetched(document) => match self.apply(cx.policy(), &document) {
                Ok(()) => (FetchState::Applied, Notification::Proceed),
                Err(reason) => {
                    let answer = Self::failed(template.opportunistic, &reason);
                    (FetchState::Failed(reason), answer)
                }
            },
            FetchState::Failed(reason) => {
                let answer = Self::failed(template.opportunistic, &reason);
                (FetchState::Failed(reason), answer)
            }
            FetchState::Applied => (FetchState::Applied, Notification::Proceed),
        };
        self.shared.state.replace(next);
        answer
    }

    fn on_teardown(&mut self) {
        self.shared.generation.set(self.shared.generation.get().wrapping_add(1));
        self.shared.state.replace(FetchState::Idle);
    }
}

struct PolicyFetch {
    shared: Rc<FetchShared>,
    generation: u32,
    body: Vec<u8>,
    max_size: usize,
    resume: ResumeHandle,
}

impl PolicyFetch {
    fn settle(&self, state: FetchState) {
        if self.shared.generation.get() == self.generation {
            self.shared.state.replace(state);
        }
    }
}

impl SessionHandler for PolicyFetch {
    fn on_receive(&mut self, _: &mut StreamHandle<'_>, data: &[u8], flags: RxFlags) -> RxOutcome {
        if self.body.len() + data.len() > self.max_size {
            self.settle(FetchState::Failed(format!(
                "document exceeds {} bytes",
                self.max_size
            )));
            return RxOutcome::Close;
        }
        self.body.extend_from_slice(data);

        if flags.eom {
            let body = std::mem::take(&mut self.body);
            self.settle(FetchState::Fetched(body));
            RxOutcome::Close
        } else {
            RxOutcome::Continue
        }
    }

    fn on_state_change(&mut self, stream: &mut StreamHandle<'_>, state: SessionState, _: TxOrdinal) {
        if !state.is_terminal() || self.shared.generation.get() != self.generation {
            return;
        }
        if matches!(*self.shared.state.borrow(), FetchState::Running) {
            let reason = match stream.last_failure() {
                Some(failure) => failure.to_string(),
                None => format!("stream ended in state {state}"),
            };
            self.settle(FetchState::Failed(reason));
        }
        self.resume.resume();
    }
}

// =============================================================================
// CREDENTIALS
// =============================================================================

/// Supplies the device root token.
pub trait CredentialSource {
    /// Store a root token under [`BlobKey::AuthRootToken`], now or later.
    ///
    /// Return [`Notification::Pending`] and call `resume` once the token
    /// has been stored to complete asynchronously.
    fn acquire(&mut self, blobs: &mut BlobStore, resume: &ResumeHandle) -> Notification;

    /// Drop any acquisition in progress.
    fn on_teardown(&mut self) {}
}

/// A fixed root token.
pub struct StaticCredentials {
    token: Zeroizing<Vec<u8>>,
}

impl StaticCredentials {
    /// Wrap a token.
    pub fn new(token: impl Into<Vec<u8>>) -> Self {
        Self {
            token: Zeroizing::new(token.into()),
        }
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("len", &self.token.len())
            .finish()
    }
}

impl CredentialSource for StaticCredentials {
    fn acquire(&mut self, blobs: &mut BlobStore, _resume: &ResumeHandle) -> Notification {
        blobs.set(BlobKey::AuthRootToken, self.token.to_vec());
        Notification::Proceed
    }
}

/// Holds a step until a root token is available.
pub struct CredentialNotifier {
    source: Box<dyn CredentialSource>,
    gate: ReadinessStage,
}

impl CredentialNotifier {
    /// Gate the step into `Registered` on `source`.
    pub fn new(source: impl CredentialSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            gate: ReadinessStage::Registered,
        }
    }

    /// Gate the step into `stage` instead.
    pub fn at(mut self, stage: ReadinessStage) -> Self {
        self.gate = stage;
        self
    }
}

impl fmt::Debug for CredentialNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialNotifier")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl ReadinessNotifier for CredentialNotifier {
    fn name(&self) -> &str {
        "credentials"
    }

    fn notify(
        &mut self,
        cx: &mut NotifyContext<'_>,
        current: ReadinessStage,
        target: ReadinessStage,
    ) -> Notification {
        if current == target || target != self.gate {
            return Notification::Proceed;
        }
        if cx.blobs().contains(BlobKey::AuthRootToken) {
            return Notification::Proceed;
        }

        let resume = cx.resume_handle();
        match self.source.acquire(cx.blobs(), &resume) {
            Notification::Proceed if cx.blobs().contains(BlobKey::AuthRootToken) => {
                debug!("root token acquired");
                Notification::Proceed
            }
            Notification::Proceed => {
                Notification::Veto("credential source provided no root token".into())
            }
            other => other,
        }
    }

    fn on_teardown(&mut self) {
        self.source.on_teardown();
    }
}

// =============================================================================
// STATIC OVERLAY
// =============================================================================

/// Lays a fixed fragment over the policy on arrival at a stage.
#[derive(Debug)]
pub struct OverlayNotifier {
    stage: ReadinessStage,
    fragment: Policy,
    applied: bool,
}

impl OverlayNotifier {
    /// Apply `fragment` when `stage` is reached.
    pub fn new(stage: ReadinessStage, fragment: Policy) -> Self {
        Self {
            stage,
            fragment,
            applied: false,
        }
    }
}

impl ReadinessNotifier for OverlayNotifier {
    fn name(&self) -> &str {
        "policy-overlay"
    }

    fn notify(
        &mut self,
        cx: &mut NotifyContext<'_>,
        current: ReadinessStage,
        target: ReadinessStage,
    ) -> Notification {
        if current == target && target == self.stage && !self.applied {
            match cx.policy().overlay(&self.fragment) {
                Ok(_) => {
                    info!(stage = %target, "policy overlay applied");
                    self.applied = true;
                }
                Err(error) => warn!(stage = %target, %error, "policy overlay rejected"),
            }
        }
        Notification::Proceed
    }

    fn on_teardown(&mut self) {
        self.applied = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::core::{PolicyError, ReadinessError, TransportError};
    use crate::policy::fixtures::sample_policy;
    use crate::policy::{StreamProtocol, StreamTemplate};
    use crate::session::{SecureStream, SessionAction, StreamId};
    use crate::system::readiness::tests::Harness;
    use crate::system::{Readiness, TransitionOutcome};
    use crate::transport::{ConnectionId, TransportEvent};

    fn harness(policy: Policy) -> (Harness, Arc<AtomicU32>) {
        let resumes = Arc::new(AtomicU32::new(0));
        let counter = resumes.clone();
        let harness = Harness {
            policy: PolicyHandle::new(policy),
            resume: Some(ResumeHandle::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Harness::default()
        };
        (harness, resumes)
    }

    fn start_spawn(harness: &mut Harness) -> (SecureStream, ConnectionId) {
        let spawn = harness.spawns.pop().expect("a spawned stream");
        let resolved = harness.policy.load().resolve_stream(&spawn.stream_type).unwrap();
        let mut stream = SecureStream::new(StreamId(99), resolved, spawn.handler, spawn.options);
        stream.start(Instant::now());
        match stream.poll_action() {
            Some(SessionAction::Connect { conn, .. }) => (stream, conn),
            other => panic!("expected connect, got {other:?}"),
        }
    }

    fn strict_probe() -> Policy {
        let fragment = Policy::builder()
            .stream(
                StreamTemplate::new(
                    CAPTIVE_PORTAL_STREAM,
                    "connectivitycheck.android.com",
                    80,
                    StreamProtocol::H1,
                )
                .with_http("GET", "generate_204")
                .with_expect(204)
                .fail_on_redirect(),
            )
            .unwrap()
            .build_fragment();
        sample_policy().overlay(&fragment).unwrap()
    }

    /// Adds a raw stream named after the document text.
    struct NameLoader;

    impl PolicyLoader for NameLoader {
        fn load(&self, text: &str) -> Result<Policy, PolicyError> {
            self.overlay(&Policy::default(), text)
        }

        fn overlay(&self, base: &Policy, text: &str) -> Result<Policy, PolicyError> {
            let name = text.trim();
            if name.is_empty() {
                return Err(PolicyError::Parse("empty document".into()));
            }
            let fragment = Policy::builder()
                .stream(StreamTemplate::new(name, "example.com", 9000, StreamProtocol::Raw))?
                .build_fragment();
            base.overlay(&fragment)
        }
    }

    fn with_fetch(opportunistic: bool) -> Policy {
        let mut template = StreamTemplate::new(FETCH_POLICY_STREAM, "warmcat.com", 80, StreamProtocol::H1)
            .with_http("GET", "policy/minimal-proxy.json");
        if opportunistic {
            template = template.opportunistic();
        }
        let fragment = Policy::builder().stream(template).unwrap().build_fragment();
        sample_policy().overlay(&fragment).unwrap()
    }

    #[test]
    fn test_captive_portal_clear() {
        let (mut harness, resumes) = harness(sample_policy());
        let notifier = CaptivePortalNotifier::new();
        let monitor = notifier.monitor();
        let mut readiness = Readiness::new();
        readiness.register(Box::new(notifier));

        let outcome = readiness
            .request_transition(&mut harness.cx(), ReadinessStage::Operational)
            .unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Pending {
                stage: ReadinessStage::TimeValid,
                notifier: "captive-portal".into()
            }
        );
        assert_eq!(harness.spawns.len(), 1);
        assert_eq!(harness.spawns[0].stream_type, CAPTIVE_PORTAL_STREAM);

        let (mut probe, conn) = start_spawn(&mut harness);
        probe.handle_transport(conn, TransportEvent::connected(Some(204)), Instant::now());
        assert!(probe.is_finished());
        assert_eq!(monitor.status(), CaptivePortalStatus::Clear);
        assert_eq!(resumes.load(Ordering::SeqCst), 1);

        assert_eq!(
            readiness.resume(&mut harness.cx()).unwrap(),
            TransitionOutcome::Reached(ReadinessStage::Operational)
        );
    }

    #[test]
    fn test_captive_portal_redirect_vetoes_strict_probe() {
        let (mut harness, _) = harness(strict_probe());
        let notifier = CaptivePortalNotifier::new();
        let monitor = notifier.monitor();
        let mut readiness = Readiness::new();
        readiness.register(Box::new(notifier));

        readiness
            .request_transition(&mut harness.cx(), ReadinessStage::Operational)
            .unwrap();
        let (mut probe, conn) = start_spawn(&mut harness);
        probe.handle_transport(conn, TransportEvent::connected(Some(302)), Instant::now());
        assert_eq!(monitor.status(), CaptivePortalStatus::BehindPortal);

        let err = readiness.resume(&mut harness.cx()).unwrap_err();
        assert!(matches!(err, ReadinessError::Vetoed { stage: ReadinessStage::TimeValid, .. }));
    }

    #[test]
    fn test_captive_portal_opportunistic_failure_proceeds() {
        let (mut harness, _) = harness(sample_policy());
        let notifier = CaptivePortalNotifier::new();
        let monitor = notifier.monitor();
        let mut readiness = Readiness::new();
        readiness.register(Box::new(notifier));

        readiness
            .request_transition(&mut harness.cx(), ReadinessStage::Operational)
            .unwrap();
        let (mut probe, conn) = start_spawn(&mut harness);
        probe.handle_transport(
            conn,
            TransportEvent::Failed(TransportError::Dns("no network".into())),
            Instant::now(),
        );
        assert_eq!(monitor.status(), CaptivePortalStatus::NoInternet);
        assert_eq!(
            readiness.resume(&mut harness.cx()).unwrap(),
            TransitionOutcome::Reached(ReadinessStage::Operational)
        );
    }

    #[test]
    fn test_captive_portal_without_template_proceeds() {
        let (mut harness, _) = harness(Policy::default());
        let mut readiness = Readiness::new();
        readiness.register(Box::new(CaptivePortalNotifier::new()));

        assert_eq!(
            readiness
                .request_transition(&mut harness.cx(), ReadinessStage::Operational)
                .unwrap(),
            TransitionOutcome::Reached(ReadinessStage::Operational)
        );
        assert!(harness.spawns.is_empty());
    }

    #[test]
    fn test_policy_fetch_overlays_document() {
        let (mut harness, resumes) = harness(with_fetch(false));
        let mut readiness = Readiness::new();
        readiness.register(Box::new(PolicyFetchNotifier::new(NameLoader)));

        let outcome = readiness
            .request_transition(&mut harness.cx(), ReadinessStage::Operational)
            .unwrap();
        assert!(matches!(
            outcome,
            TransitionOutcome::Pending { stage: ReadinessStage::PolicyValid, .. }
        ));

        let (mut fetch, conn) = start_spawn(&mut harness);
        let now = Instant::now();
        fetch.handle_transport(conn, TransportEvent::connected(Some(200)), now);
        fetch.handle_transport(conn, TransportEvent::Data { data: b"fetched".to_vec(), eom: false }, now);
        fetch.handle_transport(conn, TransportEvent::Data { data: b"_stream\n".to_vec(), eom: true }, now);
        assert_eq!(fetch.state(), SessionState::Destroyed);
        assert_eq!(resumes.load(Ordering::SeqCst), 1);

        assert_eq!(
            readiness.resume(&mut harness.cx()).unwrap(),
            TransitionOutcome::Reached(ReadinessStage::Operational)
        );
        let policy = harness.policy.load();
        assert!(policy.has_stream("fetched_stream"));
        assert!(policy.has_stream("mintest"));
    }

    #[test]
    fn test_policy_fetch_failure_vetoes_unless_opportunistic() {
        for opportunistic in [false, true] {
            let (mut harness, _) = harness(with_fetch(opportunistic));
            let mut readiness = Readiness::new();
            readiness.register(Box::new(PolicyFetchNotifier::new(NameLoader)));
            readiness
                .request_transition(&mut harness.cx(), ReadinessStage::Operational)
                .unwrap();

            let (mut fetch, conn) = start_spawn(&mut harness);
            fetch.handle_transport(
                conn,
                TransportEvent::Failed(TransportError::Connect("refused".into())),
                Instant::now(),
            );
            assert_eq!(fetch.state(), SessionState::AllRetriesFailed);

            let result = readiness.resume(&mut harness.cx());
            if opportunistic {
                assert_eq!(result.unwrap(), TransitionOutcome::Reached(ReadinessStage::Operational));
            } else {
                assert!(matches!(
                    result,
                    Err(ReadinessError::Vetoed { notifier, reason, .. })
                        if notifier == "policy-fetch" && reason.contains("refused")
                ));
            }
        }
    }

    #[test]
    fn test_policy_fetch_rejects_oversized_document() {
        let (mut harness, _) = harness(with_fetch(false));
        let mut readiness = Readiness::new();
        readiness.register(Box::new(PolicyFetchNotifier::new(NameLoader).with_max_size(4)));
        readiness
            .request_transition(&mut harness.cx(), ReadinessStage::Operational)
            .unwrap();

        let (mut fetch, conn) = start_spawn(&mut harness);
        let now = Instant::now();
        fetch.handle_transport(conn, TransportEvent::connected(Some(200)), now);
        fetch.handle_transport(conn, TransportEvent::Data { data: b"too long".to_vec(), eom: true }, now);

        assert!(matches!(
            readiness.resume(&mut harness.cx()),
            Err(ReadinessError::Vetoed { reason, .. }) if reason.contains("exceeds")
        ));
    }

    /// Completes on the second request.
    #[derive(Default)]
    struct DeferredSource {
        pending: Option<ResumeHandle>,
    }

    impl CredentialSource for DeferredSource {
        fn acquire(&mut self, blobs: &mut BlobStore, resume: &ResumeHandle) -> Notification {
            if self.pending.take().is_some() {
                blobs.set(BlobKey::AuthRootToken, b"root".to_vec());
                return Notification::Proceed;
            }
            self.pending = Some(resume.clone());
            Notification::Pending
        }
    }

    #[test]
    fn test_credentials_pending_then_ready() {
        let (mut harness, _) = harness(Policy::default());
        let mut readiness = Readiness::new();
        readiness.register(Box::new(CredentialNotifier::new(DeferredSource::default())));

        let outcome = readiness
            .request_transition(&mut harness.cx(), ReadinessStage::Operational)
            .unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Pending {
                stage: ReadinessStage::Registered,
                notifier: "credentials".into()
            }
        );

        assert_eq!(
            readiness.resume(&mut harness.cx()).unwrap(),
            TransitionOutcome::Reached(ReadinessStage::Operational)
        );
        assert_eq!(
            harness.blobs.get(BlobKey::AuthRootToken).unwrap().as_slice(),
            b"root"
        );
    }

    #[test]
    fn test_static_credentials_and_existing_token() {
        let (mut harness, _) = harness(Policy::default());
        let mut readiness = Readiness::new();
        readiness.register(Box::new(CredentialNotifier::new(StaticCredentials::new(b"abc".to_vec()))));
        assert_eq!(
            readiness
                .request_transition(&mut harness.cx(), ReadinessStage::Operational)
                .unwrap(),
            TransitionOutcome::Reached(ReadinessStage::Operational)
        );
        assert_eq!(harness.blobs.size(BlobKey::AuthRootToken), 3);
    }

    struct EmptySource;

    impl CredentialSource for EmptySource {
        fn acquire(&mut self, _: &mut BlobStore, _: &ResumeHandle) -> Notification {
            Notification::Proceed
        }
    }

    #[test]
    fn test_credentials_missing_token_vetoes() {
        let (mut harness, _) = harness(Policy::default());
        let mut readiness = Readiness::new();
        readiness.register(Box::new(CredentialNotifier::new(EmptySource)));
        assert!(matches!(
            readiness.request_transition(&mut harness.cx(), ReadinessStage::Operational),
            Err(ReadinessError::Vetoed { stage: ReadinessStage::Registered, .. })
        ));
    }

    #[test]
    fn test_overlay_notifier_applies_on_arrival() {
        let (mut harness, _) = harness(sample_policy());
        let fragment = Policy::builder()
            .stream(
                StreamTemplate::new(CAPTIVE_PORTAL_STREAM, "127.0.0.1", 1, StreamProtocol::H1)
                    .with_http("GET", "/"),
            )
            .unwrap()
            .build_fragment();

        let mut readiness = Readiness::new();
        readiness.register(Box::new(OverlayNotifier::new(ReadinessStage::Initialized, fragment)));

        readiness
            .request_transition(&mut harness.cx(), ReadinessStage::ContextCreated)
            .unwrap();
        assert_eq!(
            harness
                .policy
                .load()
                .resolve_stream_template(CAPTIVE_PORTAL_STREAM)
                .unwrap()
                .endpoint,
            "connectivitycheck.android.com"
        );

        readiness
            .request_transition(&mut harness.cx(), ReadinessStage::Initialized)
            .unwrap();
        assert_eq!(
            harness
                .policy
                .load()
                .resolve_stream_template(CAPTIVE_PORTAL_STREAM)
                .unwrap()
                .endpoint,
            "127.0.0.1"
        );
    }
}

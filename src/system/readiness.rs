//! System readiness state machine.
//!
//! The machine walks forward one stage at a time. Before each step every
//! registered notifier is asked, in registration order, whether the step may
//! happen. Once a step is taken every notifier is told about the arrival.
//!
//! A `Pending` answer parks the walk on that step until
//! [`Readiness::resume`] re-asks the whole notifier list. A `Veto` is fatal
//! and sticky until [`Readiness::teardown`].

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::blob::BlobStore;
use crate::core::{ReadinessError, SessionHandler};
use crate::policy::PolicyHandle;
use crate::session::StreamOptions;

/// Ordered bring-up stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReadinessStage {
    /// Nothing initialized.
    Uninitialized,
    /// Context allocated.
    ContextCreated,
    /// Subsystems initialized.
    Initialized,
    /// Network configuration acquired.
    Dhcp,
    /// Captive portal detection.
    CaptivePortalCheck,
    /// System time trusted.
    TimeValid,
    /// Connection policy validated (and fetched, where configured).
    PolicyValid,
    /// Device registered.
    Registered,
    /// Device authenticated.
    Authenticated,
    /// Application streams may be created.
    Operational,
}

impl ReadinessStage {
    /// All stages in order.
    pub const ALL: [ReadinessStage; 10] = [
        Self::Uninitialized,
        Self::ContextCreated,
        Self::Initialized,
        Self::Dhcp,
        Self::CaptivePortalCheck,
        Self::TimeValid,
        Self::PolicyValid,
        Self::Registered,
        Self::Authenticated,
        Self::Operational,
    ];

    /// The stage after this one.
    pub fn next(&self) -> Option<Self> {
        let index = Self::ALL.iter().position(|stage| stage == self)?;
        Self::ALL.get(index + 1).copied()
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::ContextCreated => "context-created",
            Self::Initialized => "initialized",
            Self::Dhcp => "dhcp",
            Self::CaptivePortalCheck => "captive-portal-check",
            Self::TimeValid => "time-valid",
            Self::PolicyValid => "policy-valid",
            Self::Registered => "registered",
            Self::Authenticated => "authenticated",
            Self::Operational => "operational",
        }
    }
}

impl fmt::Display for ReadinessStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A notifier's answer for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The step may happen.
    Proceed,
    /// Not yet; the notifier will call [`ResumeHandle::resume`].
    Pending,
    /// Never.
    Veto(String),
}

/// Wakes the owner of a [`Readiness`] machine to re-run a pending step.
#[derive(Clone)]
pub struct ResumeHandle {
    resume: Arc<dyn Fn() + Send + Sync>,
}

impl ResumeHandle {
    /// Wrap the wake-up callback.
    pub fn new(resume: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            resume: Arc::new(resume),
        }
    }

    /// A handle that does nothing.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Ask for the pending step to be re-run.
    pub fn resume(&self) {
        (self.resume)()
    }
}

impl fmt::Debug for ResumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResumeHandle")
    }
}

/// A stream a notifier wants started.
///
/// Spawned streams are exempt from the operational gate so that bring-up
/// work (probes, policy fetch) can run before the system is operational.
pub struct StreamSpawn {
    /// Stream type to resolve.
    pub stream_type: String,
    /// Handler for the stream.
    pub handler: Box<dyn SessionHandler>,
    /// Options for the stream.
    pub options: StreamOptions,
}

impl fmt::Debug for StreamSpawn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSpawn")
            .field("stream_type", &self.stream_type)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// What a notifier can reach while it is being asked.
pub struct NotifyContext<'a> {
    policy: &'a PolicyHandle,
    blobs: &'a mut BlobStore,
    spawns: &'a mut Vec<StreamSpawn>,
    resume: &'a ResumeHandle,
}

impl<'a> NotifyContext<'a> {
    /// Assemble a context.
    pub fn new(
        policy: &'a PolicyHandle,
        blobs: &'a mut BlobStore,
        spawns: &'a mut Vec<StreamSpawn>,
        resume: &'a ResumeHandle,
    ) -> Self {
        Self {
            policy,
            blobs,
            spawns,
            resume,
        }
    }

    /// Shared policy.
    pub fn policy(&self) -> &PolicyHandle {
        self.policy
    }

    /// Blob store.
    pub fn blobs(&mut self) -> &mut BlobStore {
        self.blobs
    }

    /// Start a stream once the notifier returns.
    pub fn spawn_stream(
        &mut self,
        stream_type: impl Into<String>,
        handler: Box<dyn SessionHandler>,
        options: StreamOptions,
    ) {
        self.spawns.push(StreamSpawn {
            stream_type: stream_type.into(),
            handler,
            options,
        });
    }

    /// A handle for resuming a step this notifier leaves pending.
    pub fn resume_handle(&self) -> ResumeHandle {
        self.resume.clone()
    }
}

/// Gatekeeper for readiness steps.
pub trait ReadinessNotifier {
    /// Name used in logs and veto errors.
    fn name(&self) -> &str;

    /// Answer for the step `current -> target`.
    ///
    /// Arrival at a stage is announced with `current == target`; the answer
    /// to an arrival is ignored.
    fn notify(
        &mut self,
        cx: &mut NotifyContext<'_>,
        current: ReadinessStage,
        target: ReadinessStage,
    ) -> Notification;

    /// The machine was torn down; drop any held state.
    fn on_teardown(&mut self) {}
}

/// Result of a transition request or resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The goal stage was reached.
    Reached(ReadinessStage),
    /// Parked on a step.
    Pending {
        /// Stage the parked step leads to.
        stage: ReadinessStage,
        /// Notifier that answered `Pending`.
        notifier: String,
    },
}

#[derive(Debug, Clone)]
struct Blocked {
    stage: ReadinessStage,
    notifier: String,
}

/// The readiness state machine.
pub struct Readiness {
    stage: ReadinessStage,
    goal: ReadinessStage,
    blocked: Option<Blocked>,
    vetoed: Option<ReadinessError>,
    notifiers: Vec<Box<dyn ReadinessNotifier>>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    /// Create a machine at `Uninitialized`.
    pub fn new() -> Self {
        Self {
            stage: ReadinessStage::Uninitialized,
            goal: ReadinessStage::Uninitialized,
            blocked: None,
            vetoed: None,
            notifiers: Vec::new(),
        }
    }

    /// Append a notifier. Notifiers are asked in registration order.
    pub fn register(&mut self, notifier: Box<dyn ReadinessNotifier>) {
        debug!(notifier = notifier.name(), "readiness notifier registered");
        self.notifiers.push(notifier);
    }

    /// Current stage.
    pub fn stage(&self) -> ReadinessStage {
        self.stage
    }

    /// Highest stage requested so far.
    pub fn goal(&self) -> ReadinessStage {
        self.goal
    }

    /// Whether a step is parked.
    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }

    /// The veto that stopped the machine, if any.
    pub fn vetoed(&self) -> Option<&ReadinessError> {
        self.vetoed.as_ref()
    }

    /// Walk forward to `target`.
    ///
    /// While a step is parked the request only raises the goal.
    pub fn request_transition(
        &mut self,
        cx: &mut NotifyContext<'_>,
        target: ReadinessStage,
    ) -> Result<TransitionOutcome, ReadinessError> {
        if let Some(veto) = &self.vetoed {
            return Err(veto.clone());
        }
        if target < self.stage {
            return Err(ReadinessError::Backwards {
                current: self.stage,
                target,
            });
        }

        self.goal = self.goal.max(target);
        if let Some(blocked) = &self.blocked {
            return Ok(TransitionOutcome::Pending {
                stage: blocked.stage,
                notifier: blocked.notifier.clone(),
            });
        }
        self.walk(cx)
    }

    /// Re-run the parked step.
    pub fn resume(&mut self, cx: &mut NotifyContext<'_>) -> Result<TransitionOutcome, ReadinessError> {
        if let Some(veto) = &self.vetoed {
            return Err(veto.clone());
        }
        if let Some(blocked) = self.blocked.take() {
            debug!(stage = %blocked.stage, notifier = %blocked.notifier, "readiness resumed");
        }
        self.walk(cx)
    }

    /// Reset to `Uninitialized` and let every notifier drop its state.
    pub fn teardown(&mut self) {
        info!(from = %self.stage, "readiness teardown");
        self.stage = ReadinessStage::Uninitialized;
        self.goal = ReadinessStage::Uninitialized;
        self.blocked = None;
        self.vetoed = None;
        for notifier in &mut self.notifiers {
            notifier.on_teardown();
        }
    }

    fn walk(&mut self, cx: &mut NotifyContext<'_>) -> Result<TransitionOutcome, ReadinessError> {
        while self.stage < self.goal {
            let Some(next) = self.stage.next() else {
                break;
            };
            let current = self.stage;

            for notifier in &mut self.notifiers {
                match notifier.notify(cx, current, next) {
                    Notification::Proceed => {}
                    Notification::Pending => {
                        debug!(stage = %next, notifier = notifier.name(), "readiness step pending");
                        let blocked = Blocked {
                            stage: next,
                            notifier: notifier.name().to_string(),
                        };
                        let outcome = TransitionOutcome::Pending {
                            stage: blocked.stage,
                            notifier: blocked.notifier.clone(),
                        };
                        self.blocked = Some(blocked);
                        return Ok(outcome);
                    }
                    Notification::Veto(reason) => {
                        warn!(stage = %next, notifier = notifier.name(), %reason, "readiness step vetoed");
                        let veto = ReadinessError::Vetoed {
                            stage: next,
                            notifier: notifier.name().to_string(),
                            reason,
                        };
                        self.vetoed = Some(veto.clone());
                        return Err(veto);
                    }
                }
            }

            self.stage = next;
            info!(stage = %next, "readiness stage reached");
            for notifier in &mut self.notifiers {
                let _ = notifier.notify(cx, next, next);
            }
        }
        Ok(TransitionOutcome::Reached(self.stage))
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.notifiers.iter().map(|n| n.name().to_string()).collect();
        f.debug_struct("Readiness")
            .field("stage", &self.stage)
            .field("goal", &self.goal)
            .field("blocked", &self.blocked)
            .field("vetoed", &self.vetoed)
            .field("notifiers", &names)
            .finish()
    }
}

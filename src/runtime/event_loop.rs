//! Single-threaded event loop driving sessions, timers and readiness.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, trace, warn};

use super::context::ContextConfig;
use crate::core::{SessionHandler, StreamError};
use crate::policy::PolicyHandle;
use crate::session::{SecureStream, SessionAction, SessionState, StreamId, StreamOptions};
use crate::system::{
    BlobStore, NotifyContext, Readiness, ReadinessNotifier, ReadinessStage, ResumeHandle,
    StreamSpawn, TransitionOutcome,
};
use crate::transport::{ConnectionId, EventSink, LoopEvent, Transport, TransportEvent};

/// Stops a running [`EventLoop`] from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl ShutdownHandle {
    /// Ask the loop to tear down and return.
    pub fn shutdown(&self) {
        let _ = self.tx.send(LoopEvent::Shutdown);
    }
}

enum Wake {
    Event(Option<LoopEvent>),
    Timer,
}

/// Owns the policy, blob store, readiness machine and every session.
///
/// All sessions are serviced from the task that awaits [`run`](Self::run)
/// or [`turn`](Self::turn); handlers never run concurrently.
pub struct EventLoop<T: Transport> {
    policy: PolicyHandle,
    blobs: BlobStore,
    readiness: Readiness,
    target_stage: ReadinessStage,
    defaults: StreamOptions,
    streams: BTreeMap<StreamId, SecureStream>,
    next_id: u64,
    transport: T,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    resume: ResumeHandle,
    stopped: bool,
}

impl<T: Transport> EventLoop<T> {
    pub(crate) fn new(
        config: ContextConfig,
        notifiers: Vec<Box<dyn ReadinessNotifier>>,
        transport: T,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let resume_tx = events_tx.clone();
        let resume = ResumeHandle::new(move || {
            let _ = resume_tx.send(LoopEvent::ResumeReadiness);
        });

        let mut readiness = Readiness::new();
        for notifier in notifiers {
            readiness.register(notifier);
        }

        Self {
            policy: PolicyHandle::new(config.policy),
            blobs: BlobStore::new(),
            readiness,
            target_stage: config.target_stage,
            defaults: config.stream_options,
            streams: BTreeMap::new(),
            next_id: 1,
            transport,
            events_tx,
            events_rx,
            resume,
            stopped: false,
        }
    }

    /// Shared policy.
    pub fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    /// Blob store.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Mutable blob store.
    pub fn blobs_mut(&mut self) -> &mut BlobStore {
        &mut self.blobs
    }

    /// Current readiness stage.
    pub fn stage(&self) -> ReadinessStage {
        self.readiness.stage()
    }

    /// Readiness machine.
    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Transport provider.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Number of live sessions.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Last reported state of a live session.
    pub fn stream_state(&self, id: StreamId) -> Option<SessionState> {
        self.streams.get(&id).map(SecureStream::state)
    }

    /// A handle that stops the loop.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Walk the readiness machine towards `target`.
    ///
    /// Streams spawned by notifiers along the way are started immediately.
    pub fn request_stage(&mut self, target: ReadinessStage) -> Result<TransitionOutcome, StreamError> {
        let mut spawns = Vec::new();
        let outcome = {
            let mut cx = NotifyContext::new(&self.policy, &mut self.blobs, &mut spawns, &self.resume);
            self.readiness.request_transition(&mut cx, target)
        };
        self.start_spawns(spawns);
        Ok(outcome?)
    }

    /// Re-run a parked readiness step.
    pub fn resume_readiness(&mut self) -> Result<TransitionOutcome, StreamError> {
        let mut spawns = Vec::new();
        let outcome = {
            let mut cx = NotifyContext::new(&self.policy, &mut self.blobs, &mut spawns, &self.resume);
            self.readiness.resume(&mut cx)
        };
        self.start_spawns(spawns);
        Ok(outcome?)
    }

    /// Create a session with the default stream options.
    pub fn create_stream(
        &mut self,
        stream_type: &str,
        handler: impl SessionHandler + 'static,
    ) -> Result<StreamId, StreamError> {
        let options = self.defaults.clone();
        self.create_stream_with(stream_type, Box::new(handler), options)
    }

    /// Create a session.
    ///
    /// Fails with [`StreamError::NotOperational`] before the system is
    /// operational and with a policy error if `stream_type` does not
    /// resolve.
    pub fn create_stream_with(
        &mut self,
        stream_type: &str,
        handler: Box<dyn SessionHandler>,
        options: StreamOptions,
    ) -> Result<StreamId, StreamError> {
        let stage = self.readiness.stage();
        if stage != ReadinessStage::Operational {
            return Err(StreamError::NotOperational(stage));
        }
        self.spawn(stream_type, handler, options)
    }

    /// Close a session.
    pub fn close_stream(&mut self, id: StreamId) -> Result<(), StreamError> {
        let now = now();
        self.stream_mut(id)?.request_close(now);
        self.flush(id);
        Ok(())
    }

    /// Connect a session created with manual connect, or skip a retry wait.
    pub fn connect_stream(&mut self, id: StreamId) -> Result<(), StreamError> {
        let now = now();
        self.stream_mut(id)?.request_connect(now);
        self.flush(id);
        Ok(())
    }

    /// Ask for a transmit callback on a session.
    pub fn request_tx(&mut self, id: StreamId) -> Result<(), StreamError> {
        let now = now();
        self.stream_mut(id)?.request_tx(now);
        self.flush(id);
        Ok(())
    }

    /// Set a metadata value on a session.
    pub fn set_stream_metadata(
        &mut self,
        id: StreamId,
        name: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<(), StreamError> {
        self.stream_mut(id)?.set_metadata(name, value);
        Ok(())
    }

    /// Bring the system up to the configured stage and service events until
    /// shut down.
    ///
    /// A readiness veto tears the context down and is returned.
    pub async fn run(&mut self) -> Result<(), StreamError> {
        let result = self.drive().await;
        if let Err(error) = &result {
            warn!(%error, "event loop stopped");
        }
        self.teardown();
        result
    }

    async fn drive(&mut self) -> Result<(), StreamError> {
        let target = self.target_stage;
        self.request_stage(target)?;
        while self.turn().await? {}
        Ok(())
    }

    /// Wait for and handle one event or timer.
    ///
    /// Returns `false` once the loop has been shut down.
    pub async fn turn(&mut self) -> Result<bool, StreamError> {
        if self.stopped {
            return Ok(false);
        }

        let wake = match self.next_deadline() {
            Some(at) => {
                tokio::select! {
                    biased;
                    event = self.events_rx.recv() => Wake::Event(event),
                    _ = time::sleep_until(time::Instant::from_std(at)) => Wake::Timer,
                }
            }
            None => Wake::Event(self.events_rx.recv().await),
        };

        match wake {
            Wake::Timer => self.fire_timers(),
            Wake::Event(Some(LoopEvent::Transport { conn, event })) => self.dispatch(conn, event),
            Wake::Event(Some(LoopEvent::ResumeReadiness)) => {
                if self.readiness.is_blocked() {
                    self.resume_readiness()?;
                }
            }
            Wake::Event(Some(LoopEvent::Shutdown) | None) => {
                info!("event loop shutting down");
                self.stopped = true;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Close every session and reset readiness to `Uninitialized`.
    pub fn teardown(&mut self) {
        let now = now();
        let ids: Vec<_> = self.streams.keys().copied().collect();
        for id in ids {
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.request_close(now);
            }
            self.flush(id);
        }
        self.streams.clear();
        self.readiness.teardown();
        while self.events_rx.try_recv().is_ok() {}
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut SecureStream, StreamError> {
        self.streams.get_mut(&id).ok_or(StreamError::UnknownStream(id))
    }

    fn spawn(
        &mut self,
        stream_type: &str,
        handler: Box<dyn SessionHandler>,
        options: StreamOptions,
    ) -> Result<StreamId, StreamError> {
        let resolved = self.policy.load().resolve_stream(stream_type)?;
        let id = StreamId(self.next_id);
        self.next_id += 1;

        let mut stream = SecureStream::new(id, resolved, handler, options);
        stream.start(now());
        self.streams.insert(id, stream);
        self.flush(id);
        Ok(id)
    }

    fn start_spawns(&mut self, spawns: Vec<StreamSpawn>) {
        for StreamSpawn {
            stream_type,
            handler,
            options,
        } in spawns
        {
            match self.spawn(&stream_type, handler, options) {
                Ok(id) => debug!(stream = %id, %stream_type, "system stream started"),
                Err(error) => warn!(%stream_type, %error, "system stream not started"),
            }
        }
    }

    fn dispatch(&mut self, conn: ConnectionId, event: TransportEvent) {
        let Some(stream) = self.streams.get_mut(&conn.stream) else {
            trace!(%conn, "event for unknown stream");
            return;
        };
        stream.handle_transport(conn, event, now());
        self.flush(conn.stream);
    }

    fn next_deadline(&self) -> Option<std::time::Instant> {
        self.streams.values().filter_map(SecureStream::poll_timeout).min()
    }

    fn fire_timers(&mut self) {
        let now = now();
        let due: Vec<_> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.poll_timeout().is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.handle_timeout(now);
            }
            self.flush(id);
        }
    }

    /// Hand queued actions to the transport and reap a finished session.
    fn flush(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        while let Some(action) = stream.poll_action() {
            match action {
                SessionAction::Connect { conn, request } => {
                    let sink = EventSink::new(self.events_tx.clone());
                    self.transport.connect(conn, request, sink);
                }
                SessionAction::Send { conn, payload, .. } => self.transport.send(conn, payload),
                SessionAction::Ping { conn } => self.transport.ping(conn),
                SessionAction::Disconnect { conn } => self.transport.close(conn),
            }
        }
        if stream.is_finished() {
            debug!(stream = %id, state = %stream.state(), "session reaped");
            self.streams.remove(&id);
        }
    }
}

impl<T: Transport> std::fmt::Debug for EventLoop<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("readiness", &self.readiness)
            .field("streams", &self.streams.keys().collect::<Vec<_>>())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

fn now() -> std::time::Instant {
    time::Instant::now().into_std()
}

//! Context configuration and builder.

use std::fmt;
use std::time::Duration;

use crate::core::StreamError;
use crate::policy::Policy;
use crate::session::StreamOptions;
use crate::system::{BlobKey, ReadinessNotifier, ReadinessStage};
use crate::transport::Transport;

use super::event_loop::EventLoop;

/// Context configuration.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Built-in policy the context starts from.
    pub policy: Policy,

    /// Stage `run` drives the readiness machine to.
    pub target_stage: ReadinessStage,

    /// Options applied to streams created without explicit options.
    pub stream_options: StreamOptions,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            target_stage: ReadinessStage::Operational,
            stream_options: StreamOptions::default(),
        }
    }
}

/// Builder for an [`EventLoop`].
pub struct ContextBuilder {
    config: ContextConfig,
    notifiers: Vec<Box<dyn ReadinessNotifier>>,
    blobs: Vec<(BlobKey, Vec<u8>)>,
}

impl ContextBuilder {
    /// Create a new context builder.
    pub fn new() -> Self {
        Self {
            config: ContextConfig::default(),
            notifiers: Vec::new(),
            blobs: Vec::new(),
        }
    }

    /// Set the built-in policy.
    pub fn policy(mut self, policy: Policy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Parse the built-in policy from a JSON document.
    #[cfg(feature = "json")]
    pub fn policy_json(mut self, document: &str) -> Result<Self, StreamError> {
        use crate::policy::{JsonPolicyLoader, PolicyLoader};

        self.config.policy = JsonPolicyLoader::new().load(document)?;
        Ok(self)
    }

    /// Set the stage `run` drives towards.
    pub fn target_stage(mut self, stage: ReadinessStage) -> Self {
        self.config.target_stage = stage;
        self
    }

    /// Default absolute timeout for new streams.
    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_options = self.config.stream_options.with_timeout(timeout);
        self
    }

    /// Seed retry jitter of new streams.
    pub fn jitter_seed(mut self, seed: u64) -> Self {
        self.config.stream_options = self.config.stream_options.with_jitter_seed(seed);
        self
    }

    /// Append a readiness notifier. Notifiers are asked in the order they
    /// are added.
    pub fn notifier(mut self, notifier: impl ReadinessNotifier + 'static) -> Self {
        self.notifiers.push(Box::new(notifier));
        self
    }

    /// Preset a blob.
    pub fn blob(mut self, key: BlobKey, value: impl Into<Vec<u8>>) -> Self {
        self.blobs.push((key, value.into()));
        self
    }

    /// The configuration assembled so far.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Validate the policy and create the event loop around `transport`.
    pub fn build<T: Transport>(self, transport: T) -> Result<EventLoop<T>, StreamError> {
        self.config.policy.validate()?;
        let mut event_loop = EventLoop::new(self.config, self.notifiers, transport);
        for (key, value) in self.blobs {
            event_loop.blobs_mut().set(key, value);
        }
        Ok(event_loop)
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let notifiers: Vec<_> = self.notifiers.iter().map(|n| n.name().to_string()).collect();
        let blobs: Vec<_> = self.blobs.iter().map(|(key, _)| *key).collect();
        f.debug_struct("ContextBuilder")
            .field("config", &self.config)
            .field("notifiers", &notifiers)
            .field("blobs", &blobs)
            .finish()
    }
}

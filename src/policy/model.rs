//! Named policy tables: retry strategies, certificates, trust stores and
//! stream templates.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::cert::Certificate;
use crate::core::{EntryKind, PolicyError, MAX_JITTER_PERCENT, SINGLE_ATTEMPT_STRATEGY};

/// A named retry / backoff strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryStrategy {
    /// Strategy name.
    pub name: String,
    /// Backoff delays in milliseconds (never empty).
    backoff_ms: Vec<u32>,
    /// Consecutive failures hidden from the application.
    pub conceal: u16,
    /// Jitter applied to each delay, in percent (at most 100).
    jitter_percent: u8,
    /// Seconds without inbound traffic before a validity ping (0 = off).
    pub secs_since_valid_ping: u16,
    /// Seconds without inbound traffic before hanging up (0 = off).
    pub secs_since_valid_hangup: u16,
    /// Retry cap; `None` retries forever.
    pub limit: Option<u32>,
}

impl RetryStrategy {
    /// Create a strategy with the given backoff table.
    ///
    /// Fails if `backoff_ms` is empty.
    pub fn new(name: impl Into<String>, backoff_ms: Vec<u32>) -> Result<Self, PolicyError> {
        let name = name.into();
        if backoff_ms.is_empty() {
            return Err(PolicyError::EmptyBackoff(name));
        }
        Ok(Self {
            name,
            backoff_ms,
            conceal: 0,
            jitter_percent: 0,
            secs_since_valid_ping: 0,
            secs_since_valid_hangup: 0,
            limit: None,
        })
    }

    /// Strategy for templates with no retry binding: one attempt, no retries.
    pub fn single_attempt() -> Self {
        Self {
            name: SINGLE_ATTEMPT_STRATEGY.to_string(),
            backoff_ms: vec![0],
            conceal: 0,
            jitter_percent: 0,
            secs_since_valid_ping: 0,
            secs_since_valid_hangup: 0,
            limit: Some(0),
        }
    }

    /// Set the conceal count.
    pub fn with_conceal(mut self, conceal: u16) -> Self {
        self.conceal = conceal;
        self
    }

    /// Set the jitter percentage (clamped to 100).
    pub fn with_jitter(mut self, percent: u8) -> Self {
        self.jitter_percent = percent.min(MAX_JITTER_PERCENT);
        self
    }

    /// Set the validity ping and hangup intervals in seconds.
    pub fn with_validity(mut self, ping_secs: u16, hangup_secs: u16) -> Self {
        self.secs_since_valid_ping = ping_secs;
        self.secs_since_valid_hangup = hangup_secs;
        self
    }

    /// Set a finite retry cap.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Backoff table in milliseconds.
    pub fn backoff_ms(&self) -> &[u32] {
        &self.backoff_ms
    }

    /// Jitter percentage, never above 100.
    pub fn jitter_percent(&self) -> u8 {
        self.jitter_percent
    }

    /// Validity ping interval, if enabled.
    pub fn valid_ping(&self) -> Option<Duration> {
        (self.secs_since_valid_ping > 0)
            .then(|| Duration::from_secs(u64::from(self.secs_since_valid_ping)))
    }

    /// Validity hangup interval, if enabled.
    pub fn valid_hangup(&self) -> Option<Duration> {
        (self.secs_since_valid_hangup > 0)
            .then(|| Duration::from_secs(u64::from(self.secs_since_valid_hangup)))
    }
}

/// A named, ordered set of certificates used as verification roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustStore {
    /// Trust store name.
    pub name: String,
    /// Certificate names in chain-building preference order.
    pub certificates: Vec<String>,
}

impl TrustStore {
    /// Create a trust store.
    pub fn new(name: impl Into<String>, certificates: Vec<String>) -> Self {
        Self {
            name: name.into(),
            certificates,
        }
    }
}

/// Wire protocol a stream template speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamProtocol {
    /// HTTP/1.1.
    H1,
    /// HTTP/2.
    H2,
    /// WebSocket.
    Ws,
    /// MQTT.
    Mqtt,
    /// Raw byte stream.
    Raw,
}

impl StreamProtocol {
    /// Parse a policy protocol tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "h1" => Some(Self::H1),
            "h2" => Some(Self::H2),
            "ws" => Some(Self::Ws),
            "mqtt" => Some(Self::Mqtt),
            "raw" => Some(Self::Raw),
            _ => None,
        }
    }

    /// Policy tag for this protocol.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::H1 => "h1",
            Self::H2 => "h2",
            Self::Ws => "ws",
            Self::Mqtt => "mqtt",
            Self::Raw => "raw",
        }
    }

    /// Whether connection success carries an HTTP status.
    pub fn is_http(&self) -> bool {
        matches!(self, Self::H1 | Self::H2)
    }
}

impl fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A named connection blueprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTemplate {
    /// Stream type name.
    pub name: String,
    /// Endpoint host name.
    pub endpoint: String,
    /// Endpoint port.
    pub port: u16,
    /// Wire protocol.
    pub protocol: StreamProtocol,
    /// Whether the connection must use TLS.
    pub tls: bool,
    /// Failure to connect must not block system readiness.
    pub opportunistic: bool,
    /// HTTP method, for HTTP templates.
    pub http_method: Option<String>,
    /// HTTP URL path, for HTTP templates.
    pub http_url: Option<String>,
    /// Expected HTTP status on success.
    pub http_expect: Option<u16>,
    /// A redirect response counts as a failed attempt.
    pub http_fail_redirect: bool,
    /// Bound retry strategy name.
    pub retry: Option<String>,
    /// Bound trust store name.
    pub trust_store: Option<String>,
    /// Metadata names mapped to HTTP header names. Outbound metadata with a
    /// mapping is sent under the header name; mapped response headers are
    /// copied back into stream metadata on connect.
    pub metadata_headers: BTreeMap<String, String>,
}

impl StreamTemplate {
    /// Create a template with defaults for everything but the endpoint.
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        port: u16,
        protocol: StreamProtocol,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            port,
            protocol,
            tls: false,
            opportunistic: false,
            http_method: None,
            http_url: None,
            http_expect: None,
            http_fail_redirect: false,
            retry: None,
            trust_store: None,
            metadata_headers: BTreeMap::new(),
        }
    }

    /// Require TLS with the given trust store.
    pub fn with_tls(mut self, trust_store: impl Into<String>) -> Self {
        self.tls = true;
        self.trust_store = Some(trust_store.into());
        self
    }

    /// Bind a retry strategy.
    pub fn with_retry(mut self, retry: impl Into<String>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    /// Set HTTP method and URL.
    pub fn with_http(mut self, method: impl Into<String>, url: impl Into<String>) -> Self {
        self.http_method = Some(method.into());
        self.http_url = Some(url.into());
        self
    }

    /// Set the expected HTTP status.
    pub fn with_expect(mut self, status: u16) -> Self {
        self.http_expect = Some(status);
        self
    }

    /// Mark the template opportunistic.
    pub fn opportunistic(mut self) -> Self {
        self.opportunistic = true;
        self
    }

    /// Treat redirects as failures.
    pub fn fail_on_redirect(mut self) -> Self {
        self.http_fail_redirect = true;
        self
    }

    /// Map a metadata name to an HTTP header (case-insensitive, trailing
    /// `:` ignored).
    pub fn with_metadata_header(mut self, name: impl Into<String>, header: &str) -> Self {
        let header = header.trim_end_matches(':').to_ascii_lowercase();
        self.metadata_headers.insert(name.into(), header);
        self
    }
}

/// A trust store with its certificates resolved.
#[derive(Debug, Clone)]
pub struct TrustChain {
    /// The trust store entry.
    pub store: Arc<TrustStore>,
    /// Certificates in store order.
    pub certificates: Vec<Arc<Certificate>>,
}

/// Everything a session needs from the policy, resolved up front.
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    /// Template.
    pub template: Arc<StreamTemplate>,
    /// Retry strategy (single-attempt when the template binds none).
    pub retry: Arc<RetryStrategy>,
    /// Trust chain, when the template binds a trust store.
    pub trust: Option<TrustChain>,
}

/// Immutable connection policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    /// Release tag of the policy document.
    pub release: Option<String>,
    /// Product the policy is for.
    pub product: Option<String>,
    /// Schema version of the document.
    pub schema_version: u32,
    pub(crate) retry: BTreeMap<String, Arc<RetryStrategy>>,
    pub(crate) certificates: BTreeMap<String, Arc<Certificate>>,
    pub(crate) trust_stores: BTreeMap<String, Arc<TrustStore>>,
    pub(crate) streams: BTreeMap<String, Arc<StreamTemplate>>,
}

impl Policy {
    /// Start building a policy.
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::default()
    }

    /// Look up a retry strategy.
    pub fn resolve_retry_strategy(&self, name: &str) -> Result<Arc<RetryStrategy>, PolicyError> {
        self.retry
            .get(name)
            .cloned()
            .ok_or_else(|| PolicyError::not_found(EntryKind::RetryStrategy, name))
    }

    /// Look up a certificate.
    pub fn resolve_certificate(&self, name: &str) -> Result<Arc<Certificate>, PolicyError> {
        self.certificates
            .get(name)
            .cloned()
            .ok_or_else(|| PolicyError::not_found(EntryKind::Certificate, name))
    }

    /// Look up a trust store.
    pub fn resolve_trust_store(&self, name: &str) -> Result<Arc<TrustStore>, PolicyError> {
        self.trust_stores
            .get(name)
            .cloned()
            .ok_or_else(|| PolicyError::not_found(EntryKind::TrustStore, name))
    }

    /// Look up a stream template.
    pub fn resolve_stream_template(&self, name: &str) -> Result<Arc<StreamTemplate>, PolicyError> {
        self.streams
            .get(name)
            .cloned()
            .ok_or_else(|| PolicyError::not_found(EntryKind::StreamType, name))
    }

    /// Resolve a template together with its retry strategy and trust chain.
    ///
    /// Fails closed if any binding is missing.
    pub fn resolve_stream(&self, name: &str) -> Result<ResolvedStream, PolicyError> {
        let template = self.resolve_stream_template(name)?;

        let retry = match &template.retry {
            Some(retry) => self.resolve_retry_strategy(retry)?,
            None => Arc::new(RetryStrategy::single_attempt()),
        };

        let trust = match &template.trust_store {
            Some(store) => {
                let store = self.resolve_trust_store(store)?;
                let certificates = store
                    .certificates
                    .iter()
                    .map(|cert| self.resolve_certificate(cert))
                    .collect::<Result<Vec<_>, _>>()?;
                Some(TrustChain {
                    store,
                    certificates,
                })
            }
            None => None,
        };

        Ok(ResolvedStream {
            template,
            retry,
            trust,
        })
    }

    /// Whether a template with this name exists.
    pub fn has_stream(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    /// Stream type names.
    pub fn stream_names(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    /// Retry strategy names.
    pub fn retry_names(&self) -> impl Iterator<Item = &str> {
        self.retry.keys().map(String::as_str)
    }

    /// Trust store names.
    pub fn trust_store_names(&self) -> impl Iterator<Item = &str> {
        self.trust_stores.keys().map(String::as_str)
    }

    /// Check cross-table references.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for store in self.trust_stores.values() {
            for cert in &store.certificates {
                if !self.certificates.contains_key(cert) {
                    return Err(PolicyError::MissingCertificate {
                        store: store.name.clone(),
                        certificate: cert.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Builder for [`Policy`] that rejects duplicate names.
#[derive(Debug, Default)]
pub struct PolicyBuilder {
    policy: Policy,
}

impl PolicyBuilder {
    /// Set release and product metadata.
    pub fn metadata(
        mut self,
        release: impl Into<String>,
        product: impl Into<String>,
        schema_version: u32,
    ) -> Self {
        self.policy.release = Some(release.into());
        self.policy.product = Some(product.into());
        self.policy.schema_version = schema_version;
        self
    }

    /// Add a retry strategy.
    pub fn retry(mut self, strategy: RetryStrategy) -> Result<Self, PolicyError> {
        insert_unique(
            &mut self.policy.retry,
            EntryKind::RetryStrategy,
            strategy.name.clone(),
            strategy,
        )?;
        Ok(self)
    }

    /// Add a certificate.
    pub fn certificate(mut self, certificate: Certificate) -> Result<Self, PolicyError> {
        insert_unique(
            &mut self.policy.certificates,
            EntryKind::Certificate,
            certificate.name.clone(),
            certificate,
        )?;
        Ok(self)
    }

    /// Add a trust store.
    pub fn trust_store(mut self, store: TrustStore) -> Result<Self, PolicyError> {
        insert_unique(
            &mut self.policy.trust_stores,
            EntryKind::TrustStore,
            store.name.clone(),
            store,
        )?;
        Ok(self)
    }

    /// Add a stream template.
    pub fn stream(mut self, template: StreamTemplate) -> Result<Self, PolicyError> {
        insert_unique(
            &mut self.policy.streams,
            EntryKind::StreamType,
            template.name.clone(),
            template,
        )?;
        Ok(self)
    }

    /// Finish and validate a complete policy.
    pub fn build(self) -> Result<Policy, PolicyError> {
        self.policy.validate()?;
        Ok(self.policy)
    }

    /// Finish an overlay fragment.
    ///
    /// Fragments may reference entries of the policy they will be laid
    /// over, so they are validated only after merging.
    pub fn build_fragment(self) -> Policy {
        self.policy
    }
}

fn insert_unique<T>(
    table: &mut BTreeMap<String, Arc<T>>,
    kind: EntryKind,
    name: String,
    value: T,
) -> Result<(), PolicyError> {
    if table.contains_key(&name) {
        return Err(PolicyError::Duplicate { kind, name });
    }
    table.insert(name, Arc::new(value));
    Ok(())
}

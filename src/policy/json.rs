//! JSON policy documents.
//!
//! Document layout:
//!
//! ```json
//! {
//!   "release": "01234567", "product": "myproduct", "schema-version": 1,
//!   "retry": [{ "default": { "backoff": [1000, 2000], "conceal": 5,
//!                            "jitterpc": 20, "svalidping": 30, "svalidhup": 35 } }],
//!   "certs": [{ "isrg_root_x1": "<base64 DER>" }],
//!   "trust_stores": [{ "name": "le_via_isrg", "stack": ["isrg_root_x1"] }],
//!   "s": [{ "mintest": { "endpoint": "warmcat.com", "port": 443, "protocol": "h1",
//!                        "http_method": "GET", "http_url": "/", "tls": true,
//!                        "retry": "default", "tls_trust_store": "le_via_isrg",
//!                        "metadata": [{ "srv": "server:" }, { "test": "x-test:" }] } }]
//! }
//! ```
//!
//! Each object inside `retry`, `certs`, `s` and `metadata` maps names to
//! entries; a name repeated within one object is rejected.
//!
//! When overlaying, a `retry` or `s` entry whose name already exists in the
//! base policy may omit fields; they are taken from the base entry.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;

use super::cert::Certificate;
use super::loader::PolicyLoader;
use super::model::{Policy, PolicyBuilder, RetryStrategy, StreamProtocol, StreamTemplate, TrustStore};
use crate::core::PolicyError;

#[derive(Debug, Deserialize)]
struct PolicyDocument {
    release: Option<String>,
    product: Option<String>,
    #[serde(rename = "schema-version")]
    schema_version: Option<u32>,
    #[serde(default)]
    retry: Vec<Entries<RetryDocument>>,
    #[serde(default)]
    certs: Vec<Entries<String>>,
    #[serde(default)]
    trust_stores: Vec<TrustStoreDocument>,
    #[serde(default)]
    s: Vec<Entries<StreamDocument>>,
}

/// One `{ "name": entry, ... }` object, in document order.
#[derive(Debug)]
struct Entries<T>(Vec<(String, T)>);

impl<T> IntoIterator for Entries<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Entries<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
            type Value = Entries<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object of named entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, T)> = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(name) = map.next_key::<String>()? {
                    if entries.iter().any(|(seen, _)| *seen == name) {
                        return Err(de::Error::custom(format!("duplicate entry name {name}")));
                    }
                    let value = map.next_value()?;
                    entries.push((name, value));
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

#[derive(Debug, Deserialize)]
struct RetryDocument {
    backoff: Option<Vec<u32>>,
    conceal: Option<u16>,
    jitterpc: Option<u8>,
    svalidping: Option<u16>,
    svalidhup: Option<u16>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TrustStoreDocument {
    name: String,
    stack: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDocument {
    endpoint: Option<String>,
    port: Option<u16>,
    protocol: Option<String>,
    http_method: Option<String>,
    http_url: Option<String>,
    tls: Option<bool>,
    opportunistic: Option<bool>,
    http_expect: Option<u16>,
    http_fail_redirect: Option<bool>,
    retry: Option<String>,
    tls_trust_store: Option<String>,
    metadata: Option<Vec<Entries<String>>>,
}

/// [`PolicyLoader`] for JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPolicyLoader;

impl JsonPolicyLoader {
    /// Create a loader.
    pub fn new() -> Self {
        Self
    }

    fn parse(text: &str) -> Result<PolicyDocument, PolicyError> {
        serde_json::from_str(text).map_err(|e| PolicyError::Parse(e.to_string()))
    }
}

impl PolicyLoader for JsonPolicyLoader {
    fn load(&self, text: &str) -> Result<Policy, PolicyError> {
        let document = Self::parse(text)?;
        convert(document, None)?.build()
    }

    fn overlay(&self, base: &Policy, text: &str) -> Result<Policy, PolicyError> {
        let document = Self::parse(text)?;
        let fragment = convert(document, Some(base))?.build_fragment();
        base.overlay(&fragment)
    }
}

fn convert(document: PolicyDocument, base: Option<&Policy>) -> Result<PolicyBuilder, PolicyError> {
    let mut builder = Policy::builder();
    if document.release.is_some() || document.product.is_some() {
        builder = builder.metadata(
            document.release.unwrap_or_default(),
            document.product.unwrap_or_default(),
            document.schema_version.unwrap_or(1),
        );
    }

    for (name, entry) in document.retry.into_iter().flatten() {
        let inherited = base.and_then(|b| b.resolve_retry_strategy(&name).ok());
        builder = builder.retry(retry_strategy(name, entry, inherited.as_deref())?)?;
    }

    for (name, encoded) in document.certs.into_iter().flatten() {
        builder = builder.certificate(Certificate::from_base64(name, &encoded)?)?;
    }

    for store in document.trust_stores {
        builder = builder.trust_store(TrustStore::new(store.name, store.stack))?;
    }

    for (name, entry) in document.s.into_iter().flatten() {
        let inherited = base.and_then(|b| b.resolve_stream_template(&name).ok());
        builder = builder.stream(stream_template(name, entry, inherited.as_deref())?)?;
    }

    Ok(builder)
}

fn retry_strategy(
    name: String,
    entry: RetryDocument,
    inherited: Option<&RetryStrategy>,
) -> Result<RetryStrategy, PolicyError> {
    let backoff = match (entry.backoff, inherited) {
        (Some(backoff), _) => backoff,
        (None, Some(base)) => base.backoff_ms().to_vec(),
        (None, None) => {
            return Err(PolicyError::Parse(format!(
                "retry strategy {name} has no backoff"
            )));
        }
    };

    let mut strategy = RetryStrategy::new(name, backoff)?
        .with_conceal(entry.conceal.or(inherited.map(|b| b.conceal)).unwrap_or(0))
        .with_jitter(
            entry
                .jitterpc
                .or(inherited.map(RetryStrategy::jitter_percent))
                .unwrap_or(0),
        )
        .with_validity(
            entry
                .svalidping
                .or(inherited.map(|b| b.secs_since_valid_ping))
                .unwrap_or(0),
            entry
                .svalidhup
                .or(inherited.map(|b| b.secs_since_valid_hangup))
                .unwrap_or(0),
        );
    strategy.limit = entry.limit.or(inherited.and_then(|b| b.limit));
    Ok(strategy)
}

fn stream_template(
    name: String,
    entry: StreamDocument,
    inherited: Option<&StreamTemplate>,
) -> Result<StreamTemplate, PolicyError> {
    let missing = |field: &str| PolicyError::Parse(format!("stream type {name} has no {field}"));

    let endpoint = entry
        .endpoint
        .or_else(|| inherited.map(|b| b.endpoint.clone()))
        .ok_or_else(|| missing("endpoint"))?;

    let protocol = match entry.protocol {
        Some(tag) => StreamProtocol::from_tag(&tag)
            .ok_or_else(|| PolicyError::Parse(format!("stream type {name}: unknown protocol {tag}")))?,
        None => inherited.map(|b| b.protocol).ok_or_else(|| missing("protocol"))?,
    };

    let tls = entry.tls.or(inherited.map(|b| b.tls)).unwrap_or(false);
    let port = entry
        .port
        .or(inherited.map(|b| b.port))
        .unwrap_or(if tls { 443 } else { 80 });

    Ok(StreamTemplate {
        endpoint,
        port,
        protocol,
        tls,
        opportunistic: entry
            .opportunistic
            .or(inherited.map(|b| b.opportunistic))
            .unwrap_or(false),
        http_method: entry
            .http_method
            .or_else(|| inherited.and_then(|b| b.http_method.clone())),
        http_url: entry
            .http_url
            .or_else(|| inherited.and_then(|b| b.http_url.clone())),
        http_expect: entry.http_expect.or(inherited.and_then(|b| b.http_expect)),
        http_fail_redirect: entry
            .http_fail_redirect
            .or(inherited.map(|b| b.http_fail_redirect))
            .unwrap_or(false),
        retry: entry.retry.or_else(|| inherited.and_then(|b| b.retry.clone())),
        trust_store: entry
            .tls_trust_store
            .or_else(|| inherited.and_then(|b| b.trust_store.clone())),
        metadata_headers: match entry.metadata {
            Some(metadata) => metadata_headers(metadata),
            None => inherited.map(|b| b.metadata_headers.clone()).unwrap_or_default(),
        },
        name,
    })
}

/// Metadata entries with an empty header name are plain metadata and carry
/// no mapping.
fn metadata_headers(metadata: Vec<Entries<String>>) -> BTreeMap<String, String> {
    metadata
        .into_iter()
        .flatten()
        .filter_map(|(name, header)| {
            let header = header.trim_end_matches(':').to_ascii_lowercase();
            (!header.is_empty()).then_some((name, header))
        })
        .collect()
}

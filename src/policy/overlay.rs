//! Policy overlay and the shared policy handle.
//!
//! An overlay merges by name: entries of the fragment replace same-named
//! entries of the base, base-only entries survive. [`PolicyHandle`] publishes
//! the merged result with a single atomic store, so a reader sees either the
//! old policy or the fully merged one.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::model::Policy;
use crate::core::PolicyError;

impl Policy {
    /// Lay `fragment` over this policy and validate the result.
    pub fn overlay(&self, fragment: &Policy) -> Result<Policy, PolicyError> {
        let merged = Policy {
            release: fragment.release.clone().or_else(|| self.release.clone()),
            product: fragment.product.clone().or_else(|| self.product.clone()),
            schema_version: self.schema_version.max(fragment.schema_version),
            retry: merge(&self.retry, &fragment.retry),
            certificates: merge(&self.certificates, &fragment.certificates),
            trust_stores: merge(&self.trust_stores, &fragment.trust_stores),
            streams: merge(&self.streams, &fragment.streams),
        };
        merged.validate()?;
        Ok(merged)
    }

    /// Whether this policy has no entries at all.
    pub fn is_empty(&self) -> bool {
        self.retry.is_empty()
            && self.certificates.is_empty()
            && self.trust_stores.is_empty()
            && self.streams.is_empty()
    }
}

fn merge<T>(
    base: &BTreeMap<String, Arc<T>>,
    overlay: &BTreeMap<String, Arc<T>>,
) -> BTreeMap<String, Arc<T>> {
    let mut merged = base.clone();
    for (name, entry) in overlay {
        merged.insert(name.clone(), Arc::clone(entry));
    }
    merged
}

/// Shared, atomically replaceable policy.
///
/// Cloning the handle shares the same underlying policy slot.
#[derive(Debug, Clone)]
pub struct PolicyHandle {
    inner: Arc<ArcSwap<Policy>>,
}

impl PolicyHandle {
    /// Wrap an initial policy.
    pub fn new(policy: Policy) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(policy)),
        }
    }

    /// Current policy snapshot.
    pub fn load(&self) -> Arc<Policy> {
        self.inner.load_full()
    }

    /// Replace the policy wholesale.
    pub fn replace(&self, policy: Policy) {
        self.inner.store(Arc::new(policy));
    }

    /// Overlay a fragment and publish the merged policy.
    ///
    /// On error the current policy is left untouched.
    pub fn overlay(&self, fragment: &Policy) -> Result<Arc<Policy>, PolicyError> {
        self.overlay_with(|base| base.overlay(fragment))
    }

    /// Compute a new policy from the current one and publish it.
    pub fn overlay_with<F>(&self, build: F) -> Result<Arc<Policy>, PolicyError>
    where
        F: FnOnce(&Policy) -> Result<Policy, PolicyError>,
    {
        let base = self.load();
        let merged = Arc::new(build(&base)?);
        self.inner.store(Arc::clone(&merged));
        tracing::debug!(
            streams = merged.streams.len(),
            retry = merged.retry.len(),
            trust_stores = merged.trust_stores.len(),
            "policy overlay applied"
        );
        Ok(merged)
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(Policy::default())
    }
}

//! Policy document loader collaborator.

use super::model::Policy;
use crate::core::PolicyError;

/// Turns policy documents into [`Policy`] values.
///
/// The core never parses text itself; readiness notifiers that fetch a
/// remote policy go through this trait.
pub trait PolicyLoader {
    /// Parse a complete policy document.
    fn load(&self, text: &str) -> Result<Policy, PolicyError>;

    /// Parse a document and lay it over `base`.
    fn overlay(&self, base: &Policy, text: &str) -> Result<Policy, PolicyError>;
}

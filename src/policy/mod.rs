//! Connection policy: named tables, overlay and loading.

mod cert;
mod loader;
mod model;
mod overlay;

#[cfg(feature = "json")]
mod json;

pub use cert::*;
pub use loader::*;
pub use model::*;
pub use overlay::*;

#[cfg(feature = "json")]
pub use json::*;

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Policy shaped like a minimal client deployment.
    pub(crate) fn sample_policy() -> Policy {
        Policy::builder()
            .metadata("01234567", "myproduct", 1)
            .retry(
                RetryStrategy::new("default", vec![1000, 2000, 3000, 5000, 10000])
                    .unwrap()
                    .with_conceal(5)
                    .with_jitter(20)
                    .with_validity(30, 35),
            )
            .unwrap()
            .certificate(Certificate::from_der("isrg_root_x1", vec![1, 2, 3]))
            .unwrap()
            .certificate(Certificate::from_der("le_x3", vec![4, 5, 6]))
            .unwrap()
            .trust_store(TrustStore::new(
                "le_via_isrg",
                vec!["isrg_root_x1".into(), "le_x3".into()],
            ))
            .unwrap()
            .stream(
                StreamTemplate::new("mintest", "warmcat.com", 443, StreamProtocol::H1)
                    .with_tls("le_via_isrg")
                    .with_retry("default")
                    .with_http("GET", "/"),
            )
            .unwrap()
            .stream(
                StreamTemplate::new(
                    "captive_portal_detect",
                    "connectivitycheck.android.com",
                    80,
                    StreamProtocol::H1,
                )
                .with_http("GET", "generate_204")
                .with_expect(204)
                .opportunistic()
                .fail_on_redirect(),
            )
            .unwrap()
            .build()
            .unwrap()
    }
}

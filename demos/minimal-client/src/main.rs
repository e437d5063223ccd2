//! Minimal Secure Streams client.
//!
//! Brings the system up with a built-in policy, probes for a captive portal,
//! then fetches the `mintest` stream type once over TLS and prints the
//! response along with the mapped `srv` and `test` response headers.
//!
//! Environment variables:
//! - RUST_LOG: tracing filter (default `info`)

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use secure_streams::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const POLICY: &str = concat!(
    r#"{
    "release": "01234567",
    "product": "myproduct",
    "schema-version": 1,
    "retry": [{"default": {
        "backoff": [1000, 2000, 3000, 5000, 10000],
        "conceal": 5,
        "jitterpc": 20,
        "svalidping": 30,
        "svalidhup": 35
    }}],
    "certs": [{"isrg_root_x1": ""#,
    "MIIFazCCA1OgAwIBAgIRAIIQz7DSQONZRGPgu2OCiwAwDQYJKoZIhvcNAQELBQAw",
    "TzELMAkGA1UEBhMCVVMxKTAnBgNVBAoTIEludGVybmV0IFNlY3VyaXR5IFJlc2Vh",
    "cmNoIEdyb3VwMRUwEwYDVQQDEwxJU1JHIFJvb3QgWDEwHhcNMTUwNjA0MTEwNDM4",
    "WhcNMzUwNjA0MTEwNDM4WjBPMQswCQYDVQQGEwJVUzEpMCcGA1UEChMgSW50ZXJu",
    "ZXQgU2VjdXJpdHkgUmVzZWFyY2ggR3JvdXAxFTATBgNVBAMTDElTUkcgUm9vdCBY",
    "MTCCAiIwDQYJKoZIhvcNAQEBBQADggIPADCCAgoCggIBAK3oJHP0FDfzm54rVygc",
    "h77ct984kIxuPOZXoHj3dcKi/vVqbvYATyjb3miGbESTtrFj/RQSa78f0uoxmyF+",
    "0TM8ukj13Xnfs7j/EvEhmkvBioZxaUpmZmyPfjxwv60pIgbz5MDmgK7iS4+3mX6U",
    "A5/TR5d8mUgjU+g4rk8Kb4Mu0UlXjIB0ttov0DiNewNwIRt18jA8+o+u3dpjq+sW",
    "T8KOEUt+zwvo/7V3LvSye0rgTBIlDHCNAymg4VMk7BPZ7hm/ELNKjD+Jo2FR3qyH",
    "B5T0Y3HsLuJvW5iB4YlcNHlsdu87kGJ55tukmi8mxdAQ4Q7e2RCOFvu396j3x+UC",
    "B5iPNgiV5+I3lg02dZ77DnKxHZu8A/lJBdiB3QW0KtZB6awBdpUKD9jf1b0SHzUv",
    "KBds0pjBqAlkd25HN7rOrFleaJ1/ctaJxQZBKT5ZPt0m9STJEadao0xAH0ahmbWn",
    "OlFuhjuefXKnEgV4We0+UXgVCwOPjdAvBbI+e0ocS3MFEvzG6uBQE3xDk3SzynTn",
    "jh8BCNAw1FtxNrQHusEwMFxIt4I7mKZ9YIqioymCzLq9gwQbooMDQaHWBfEbwrbw",
    "qHyGO0aoSCqI3Haadr8faqU9GY/rOPNk3sgrDQoo//fb4hVC1CLQJ13hef4Y53CI",
    "rU7m2Ys6xt0nUW7/vGT1M0NPAgMBAAGjQjBAMA4GA1UdDwEB/wQEAwIBBjAPBgNV",
    "HRMBAf8EBTADAQH/MB0GA1UdDgQWBBR5tFnme7bl5AFzgAiIyBpY9umbbjANBgkq",
    "hkiG9w0BAQsFAAOCAgEAVR9YqbyyqFDQDLHYGmkgJykIrGF1XIpu+ILlaS/V9lZL",
    "ubhzEFnTIZd+50xx+7LSYK05qAvqFyFWhfFQDlnrzuBZ6brJFe+GnY+EgPbk6ZGQ",
    "3BebYhtF8GaV0nxvwuo77x/Py9auJ/GpsMiu/X1+mvoiBOv/2X/qkSsisRcOj/KK",
    "NFtY2PwByVS5uCbMiogziUwthDyC3+6WVwW6LLv3xLfHTjuCvjHIInNzktHCgKQ5",
    "ORAzI4JMPJ+GslWYHb4phowim57iaztXOoJwTdwJx4nLCgdNbOhdjsnvzqvHu7Ur",
    "TkXWStAmzOVyyghqpZXjFaH3pO3JLF+l+/+sKAIuvtd7u+Nxe5AW0wdeRlN8NwdC",
    "jNPElpzVmbUq4JUagEiuTDkHzsxHpFKVK7q4+63SM1N95R1NbdWhscdCb+ZAJzVc",
    "oyi3B43njTOQ5yOf+1CceWxG1bQVs5ZufpsMljq4Ui0/1lvh+wjChP4kqKOJ2qxq",
    "4RgqsahDYVvTH9w7jXbyLeiNdd8XM2w9U/t7y0Ff/9yi0GE44Za4rF2LN9d11TPA",
    "mRGunUHBcnWEvgJBQl9nJEiU0Zsnvgc/ubhPgXRR4Xq37Z0j4r7g1SgEEzwxA57d",
    "emyPxgcYxn/eR44/KJ4EBs+lVDR3veyJm+kXQ99b21/+jh5Xos1AnX5iItreGCc=",
    r#""}],
    "trust_stores": [{"name": "le_via_isrg", "stack": ["isrg_root_x1"]}],
    "s": [
        {"mintest": {
            "endpoint": "warmcat.com",
            "port": 443,
            "protocol": "h1",
            "http_method": "GET",
            "http_url": "",
            "tls": true,
            "retry": "default",
            "tls_trust_store": "le_via_isrg",
            "metadata": [{"srv": "server:"}, {"test": "x-test:"}]
        }},
        {"captive_portal_detect": {
            "endpoint": "connectivitycheck.android.com",
            "port": 80,
            "protocol": "h1",
            "http_method": "GET",
            "http_url": "generate_204",
            "http_expect": 204,
            "http_fail_redirect": true,
            "opportunistic": true
        }}
    ]
}"#
);

/// Prints the response and flags completion.
struct Fetch {
    received: usize,
    finished: Rc<Cell<bool>>,
}

impl SessionHandler for Fetch {
    fn on_receive(&mut self, stream: &mut StreamHandle<'_>, data: &[u8], flags: RxFlags) -> RxOutcome {
        if self.received == 0 {
            let header = |name: &str| {
                stream
                    .metadata(name)
                    .map(|value| String::from_utf8_lossy(value).into_owned())
                    .unwrap_or_else(|| "not set".to_string())
            };
            info!(srv = %header("srv"), test = %header("test"), "response metadata");
        }
        self.received += data.len();
        print!("{}", String::from_utf8_lossy(data));
        if flags.eom { RxOutcome::Close } else { RxOutcome::Continue }
    }

    fn on_state_change(&mut self, stream: &mut StreamHandle<'_>, state: SessionState, _: TxOrdinal) {
        info!(stream = %stream.id(), %state, "mintest");
        match state {
            SessionState::Destroyed => {
                info!(bytes = self.received, "fetch complete");
                self.finished.set(true);
            }
            SessionState::AllRetriesFailed | SessionState::Timeout => {
                warn!(failure = ?stream.last_failure(), "fetch failed");
                self.finished.set(true);
            }
            _ => {}
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut context = ContextBuilder::new()
        .policy_json(POLICY)?
        .notifier(CaptivePortalNotifier::new().with_probe_timeout(Duration::from_secs(10)))
        .stream_timeout(Duration::from_secs(60))
        .build(TcpTransport::new())?;

    let shutdown = context.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    context.request_stage(ReadinessStage::Operational)?;

    let finished = Rc::new(Cell::new(false));
    let mut created = false;
    loop {
        if !created && context.stage() == ReadinessStage::Operational {
            let handler = Fetch {
                received: 0,
                finished: finished.clone(),
            };
            context.create_stream("mintest", handler)?;
            created = true;
        }
        if finished.get() || !context.turn().await? {
            break;
        }
    }

    context.teardown();
    Ok(())
}

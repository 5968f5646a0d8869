//! Shared scaffolding for the per-module test suites

use tracing::subscriber::DefaultGuard;

/// Route tracing output from the current test through the capturing test
/// writer, honoring `RUST_LOG` for filtering
///
/// Hold the returned guard for the duration of the test:
///
/// ```ignore
/// let _guard = subscribe();
/// ```
pub(crate) fn subscribe() -> DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

//! Tracing subscriber setup
//!
//! Library code only emits `tracing` events. Binaries, benches and tests that
//! want to see them call [`init_tracing`] once; `RUST_LOG` overrides the
//! default `hierarchy_core=info` filter.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "hierarchy_core=info";

/// Install a formatting subscriber driven by `RUST_LOG`
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::debug!("subscriber installed");
    }
}

//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; the binary installs the
//! subscriber once at startup. `RUST_LOG` always wins over the defaults.

use tracing_subscriber::EnvFilter;

/// Default filter: gateway at `info`, the protocol stack quieted to `warn`.
pub const DEFAULT_FILTER: &str = "info,opcua=warn";

/// Filter used with `--verbose`.
pub const VERBOSE_FILTER: &str = "info,scada_gateway=debug,opcua=warn";

/// Pick the filter directive for the requested verbosity.
pub fn filter_directive(verbose: bool) -> &'static str {
    if verbose {
        VERBOSE_FILTER
    } else {
        DEFAULT_FILTER
    }
}

/// Build the stderr subscriber without installing it.
pub fn subscriber(verbose: bool) -> impl tracing::Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .compact()
        .finish()
}

/// Install the global stderr subscriber. Subsequent calls are no-ops.
pub fn init(verbose: bool) {
    let _ = tracing::subscriber::set_global_default(subscriber(verbose));
}

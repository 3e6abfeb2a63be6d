//! Tracing subscriber setup for the `kbx` binary.
//!
//! Log lines go to stderr so stdout stays parseable for scripts.

use tracing_subscriber::EnvFilter;

/// Build the filter: `KBX_LOG` > `RUST_LOG` > `verbose`-derived default.
fn build_env_filter(verbose: bool) -> EnvFilter {
    if let Ok(directives) = std::env::var("KBX_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }

    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let directive = if verbose {
        "warn,kb_indexer=debug,kbx=debug"
    } else {
        "warn,kb_indexer=info,kbx=info"
    };
    EnvFilter::new(directive)
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

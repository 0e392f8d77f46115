//! Tracing subscriber initialization (stderr, so stdout stays machine-readable).

use tracing_subscriber::EnvFilter;

fn filter_from_env() -> EnvFilter {
    for key in ["WEBANSWER_LOG", "RUST_LOG"] {
        if let Ok(v) = std::env::var(key) {
            if let Ok(f) = EnvFilter::try_new(v.trim()) {
                if !v.trim().is_empty() {
                    return f;
                }
            }
        }
    }
    EnvFilter::new("warn")
}

/// Install the global subscriber. A second call is a no-op.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_from_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

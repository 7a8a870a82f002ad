// 📜 Logging
// `RUST_LOG` wins when set; otherwise info, or debug for this crate with --debug

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn default_filter(debug: bool) -> &'static str {
    if debug {
        "loan_extract=debug,info"
    } else {
        "loan_extract=info,warn"
    }
}

/// Install the global subscriber. Safe to call more than once.
pub fn init_logging(debug: bool) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(debug).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

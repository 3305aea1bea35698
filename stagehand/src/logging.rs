//! Tracing initialization for the CLI.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "STAGEHAND_LOG";

const DEFAULT_FILTER: &str = "warn";

static INIT: OnceLock<()> = OnceLock::new();

/// Install the stderr subscriber.
///
/// Filter comes from `STAGEHAND_LOG`, defaulting to `warn` so diagnostic
/// lines stay out of unit output. Calling this more than once is a no-op.
pub fn init_logging() {
    INIT.get_or_init(|| {
        let filter = filter_from(std::env::var(LOG_ENV).ok().as_deref());
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false);

        if let Err(e) = tracing_subscriber::registry()
            .with(fmt_layer)
            .with(filter)
            .try_init()
        {
            eprintln!("stagehand: logging already initialised: {}", e);
        }
    });
}

fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_fallbacks() {
        assert_eq!(filter_from(None).to_string(), "warn");
        assert_eq!(
            filter_from(Some("stagehand=debug")).to_string(),
            "stagehand=debug"
        );
        assert_eq!(filter_from(Some("stagehand=loud")).to_string(), "warn");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_logging();
        init_logging();
    }
}

//! Tracing bootstrap for the smoke binary.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,storefront_http=debug,storefront_realtime=debug";

/// Install the global subscriber.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `STOREFRONT_LOG`
/// 3) internal default filter
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(filter_from(
            EnvFilter::try_from_default_env().ok(),
            env::var("STOREFRONT_LOG").ok(),
        ))
        .try_init();
}

fn filter_from(rust_log: Option<EnvFilter>, storefront_log: Option<String>) -> EnvFilter {
    if let Some(filter) = rust_log {
        return filter;
    }

    if let Some(value) = storefront_log.filter(|v| !v.trim().is_empty())
        && let Ok(filter) = EnvFilter::try_new(value)
    {
        return filter;
    }

    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(filter: &str) -> String {
        EnvFilter::new(filter).to_string()
    }

    #[test]
    fn falls_back_to_default_filter() {
        assert_eq!(filter_from(None, None).to_string(), rendered(DEFAULT_FILTER));
        assert_eq!(
            filter_from(None, Some("  ".to_owned())).to_string(),
            rendered(DEFAULT_FILTER)
        );
    }

    #[test]
    fn rust_log_wins_over_storefront_log() {
        assert_eq!(
            filter_from(None, Some("warn".to_owned())).to_string(),
            rendered("warn")
        );
        assert_eq!(
            filter_from(Some(EnvFilter::new("error")), Some("warn".to_owned())).to_string(),
            rendered("error")
        );
    }
}

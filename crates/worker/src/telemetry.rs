//! Log output for the worker.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::TelemetryConfig;

/// `RUST_LOG` when set, else the configured level.
fn filter(config: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Calling it twice is harmless: the second
/// install fails quietly and the first subscriber stays.
pub fn init(config: &TelemetryConfig) {
    let registry = tracing_subscriber::registry().with(filter(config));
    let installed = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_level_falls_back_to_info() {
        let config = TelemetryConfig {
            level: "worker=loudest".into(),
            json: false,
        };
        // RUST_LOG may be set in CI; only the fallback path is asserted.
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(
                filter(&config).max_level_hint(),
                Some(tracing_subscriber::filter::LevelFilter::INFO)
            );
        }
    }

    #[test]
    fn init_twice_is_harmless() {
        init(&TelemetryConfig::default());
        init(&TelemetryConfig {
            level: "debug".into(),
            json: true,
        });
    }
}

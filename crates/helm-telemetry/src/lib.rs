use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the tracing bootstrap.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "helm_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

/// Initialize the tracing subscriber. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_string(config)));

    if config.json {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

fn filter_string(config: &TelemetryConfig) -> String {
    let mut filter = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_string_includes_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::INFO,
            module_levels: vec![
                ("helm_store".to_string(), Level::DEBUG),
                ("helm_core".to_string(), Level::WARN),
            ],
            json: false,
        };
        assert_eq!(filter_string(&config), "info,helm_store=debug,helm_core=warn");
    }

    #[test]
    fn default_is_plain_info() {
        let config = TelemetryConfig::default();
        assert_eq!(filter_string(&config), "info");
        assert!(!config.json);
    }
}

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Mirrors `golem_common::tracing::TracingConfig`: a small, serializable
/// knob set rather than a raw `tracing-subscriber` builder, so it composes
/// with the rest of a service's `figment`-loaded config.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub json: bool,
    pub default_filter: String,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: false,
            default_filter: "info".to_string(),
        }
    }

    pub fn test_pretty_without_time(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            json: false,
            default_filter: "debug".to_string(),
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(filter) = std::env::var("RUST_LOG") {
            self.default_filter = filter;
        }
        self
    }
}

/// Installs the global tracing subscriber. Call once at process startup.
pub fn init_tracing(config: &TracingConfig) {
    let filter = EnvFilter::try_new(&config.default_filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        let subscriber = Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json());
        let _ = subscriber.try_init();
    } else {
        let subscriber = Registry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer());
        let _ = subscriber.try_init();
    }
}

//! Tracing/logging initialization.
//!
//! `RUST_LOG` takes precedence over the configured level so individual
//! modules can be turned up without a config change.

use tracing_subscriber::EnvFilter;

/// Log level and output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// Default filter directive, e.g. `info` or `echoboard_infra=debug`.
    pub level: String,
    /// JSON lines when true, human-readable output otherwise.
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl LogSettings {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(settings: &LogSettings) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(settings.filter())
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = if settings.json {
        builder.json().with_target(false).try_init()
    } else {
        builder.pretty().try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_level_falls_back_to_info() {
        let settings = LogSettings {
            level: "not==valid[".to_string(),
            json: false,
        };
        // Building the filter must not panic whatever RUST_LOG holds.
        let _ = settings.filter();
    }

    #[test]
    fn init_twice_is_a_no_op() {
        init(&LogSettings::default());
        init(&LogSettings {
            level: "debug".to_string(),
            json: false,
        });
    }
}

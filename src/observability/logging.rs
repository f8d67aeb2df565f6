use serde::Deserialize;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{AppError, Result};

/// The `[logging]` section of the settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
    pub include_file: bool,
    pub include_line: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
            include_file: false,
            include_line: false,
        }
    }
}

/// Log output format. Unrecognised names select `Pretty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl From<&str> for LogFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

impl From<String> for LogFormat {
    fn from(s: String) -> Self {
        LogFormat::from(s.as_str())
    }
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let base = fmt::layer()
        .with_target(config.include_target)
        .with_file(config.include_file)
        .with_line_number(config.include_line);

    let layer = match config.format {
        LogFormat::Json => base.json().with_span_events(FmtSpan::CLOSE).boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to initialize logging: {}", e)))?;

    tracing::info!("Logging initialized: level={} format={:?}", config.level, config.format);
    Ok(())
}

/// Keeps the first and last `visible_chars` characters of `value` and
/// stars the rest. Values too short to keep both ends are fully starred.
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    let len = value.chars().count();
    if len <= visible_chars * 2 {
        return "*".repeat(len);
    }

    value
        .chars()
        .enumerate()
        .map(|(i, c)| if i < visible_chars || i >= len - visible_chars { c } else { '*' })
        .collect()
}

/// Masked form of an organisation id for log lines.
pub fn mask_uuid(uuid: &uuid::Uuid) -> String {
    mask_sensitive(&uuid.hyphenated().to_string(), 4)
}

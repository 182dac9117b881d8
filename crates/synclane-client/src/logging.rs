//! Subscriber installation driven by [`TelemetryConfig`].

use synclane_config::TelemetryConfig;
use synclane_telemetry::{LogFormat, LoggingConfig, build_sha, init_logging};

use crate::error::ClientError;

/// Install the global tracing subscriber described by `config`.
///
/// `RUST_LOG` overrides the configured level. Without an explicit format the
/// build profile decides (pretty for debug builds, JSON otherwise).
///
/// # Errors
///
/// Returns an error if the level is not a valid filter directive or a global
/// subscriber is already installed.
pub fn install_logging(config: &TelemetryConfig) -> Result<(), ClientError> {
    let format = config
        .log_format
        .as_deref()
        .map_or_else(LogFormat::infer, LogFormat::parse_or_infer);
    init_logging(&LoggingConfig {
        level: &config.level,
        format,
        build_sha: build_sha(),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_rejected() {
        let config = TelemetryConfig {
            level: "synclane_client=debug".into(),
            log_format: Some("json".into()),
        };
        let _ = install_logging(&config);
        assert!(matches!(
            install_logging(&config),
            Err(ClientError::Telemetry { .. })
        ));
    }
}

use std::io::Write;

use analysis_core::config::{LogFormat, SelectionStrategy};
use plant_analysis_worker::common::{load_config, StartupConfig};
use tempfile::NamedTempFile;

#[test]
fn test_shipped_config_is_valid() {
    let startup = StartupConfig {
        config_path: Some("config/analysis-worker.toml".to_string()),
        ..StartupConfig::default()
    };

    let config = load_config(&startup).unwrap();
    assert_eq!(config.provider_selection.strategy, SelectionStrategy::RoundRobin);
    assert_eq!(config.available_providers(), vec!["openai", "gemini", "anthropic"]);
    assert_eq!(config.worker.rate_limit_for("anthropic"), 100);
    assert_eq!(config.worker.rate_limit_for("gemini"), 350);
}

#[test]
fn test_command_line_overrides_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[worker]
worker_id = "from-file"

[providers.gemini]
endpoint = "http://localhost:9000/analyze"

[observability]
log_level = "warn"
"#
    )
    .unwrap();

    let startup = StartupConfig {
        config_path: Some(file.path().to_string_lossy().into_owned()),
        log_level: Some("debug".to_string()),
        log_format: Some(LogFormat::Json),
        worker_id: Some("from-cli".to_string()),
    };

    let config = load_config(&startup).unwrap();
    assert_eq!(config.worker.worker_id, "from-cli");
    assert_eq!(config.observability.log_level, "debug");
    assert_eq!(config.observability.log_format, LogFormat::Json);
}

#[test]
fn test_missing_config_file_is_reported() {
    let startup = StartupConfig {
        config_path: Some("/nonexistent/analysis-worker.toml".to_string()),
        ..StartupConfig::default()
    };

    let err = load_config(&startup).unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/analysis-worker.toml"));
}

#[test]
fn test_empty_worker_id_override_fails_validation() {
    let startup = StartupConfig {
        config_path: Some("config/analysis-worker.toml".to_string()),
        worker_id: Some(String::new()),
        ..StartupConfig::default()
    };

    assert!(load_config(&startup).is_err());
}

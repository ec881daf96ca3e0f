use super::SAMPLE_CONFIG;
use crate::config::{AppConfig, LogFormat, ProviderEndpointConfig, SelectionStrategy};

fn minimal_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.providers.insert(
        "openai".to_string(),
        ProviderEndpointConfig::new("http://localhost:8082/analyze"),
    );
    config
}

#[test]
fn test_defaults() {
    let config = minimal_config();

    assert!(config.validate().is_ok());
    assert_eq!(config.worker.rate_limit_per_minute, 350);
    assert_eq!(config.worker.rate_limit_max_wait_ms, 5000);
    assert_eq!(config.message_queue.prefetch_count, 10);
    assert_eq!(config.message_queue.reconnect_delay_ms, 5000);
    assert_eq!(config.message_queue.message_ttl_ms, 86_400_000);
    assert_eq!(config.message_queue.results_queue, "analysis-results-queue");
    assert_eq!(config.message_queue.dead_letter_queue, "analysis-dlq");
    assert_eq!(
        config.message_queue.queue_for("gemini"),
        Some("gemini-analysis-queue")
    );
    assert_eq!(config.rate_limiter.key_prefix, "ziraai:ratelimit:");
    assert_eq!(config.rate_limiter.key_ttl_seconds, 120);
    assert_eq!(config.provider_selection.strategy, SelectionStrategy::RoundRobin);
    assert_eq!(config.observability.log_format, LogFormat::Pretty);
}

#[test]
fn test_from_toml() {
    let config = AppConfig::from_toml(SAMPLE_CONFIG).unwrap();

    assert_eq!(config.worker.worker_id, "worker-test-1");
    assert_eq!(config.worker.rate_limit_for("anthropic"), 50);
    assert_eq!(config.worker.rate_limit_for("gemini"), 350);
    assert_eq!(config.message_queue.prefetch_count, 5);
    assert_eq!(config.provider_selection.strategy, SelectionStrategy::Weighted);
    assert_eq!(config.provider_selection.weights.len(), 2);
    assert_eq!(config.provider_selection.weights[0].weight, 70.0);
    assert_eq!(
        config.provider_selection.metadata["gemini"].quality_score,
        Some(9)
    );
    assert_eq!(config.available_providers(), vec!["gemini", "openai"]);
    assert_eq!(config.providers["openai"].timeout_seconds, 60);
    assert_eq!(config.providers["gemini"].timeout_seconds, 120);
}

#[test]
fn test_toml_roundtrip() {
    let config = AppConfig::from_toml(SAMPLE_CONFIG).unwrap();
    let toml_str = config.to_toml().unwrap();
    let parsed = AppConfig::from_toml(&toml_str).unwrap();

    assert_eq!(config, parsed);
}

#[test]
fn test_requires_at_least_one_provider() {
    let config = AppConfig::default();
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("至少需要配置一个AI提供商"));
}

#[test]
fn test_invalid_urls_rejected() {
    let mut config = minimal_config();
    config.message_queue.url = "http://localhost".to_string();
    assert!(config.validate().is_err());

    let mut config = minimal_config();
    config.rate_limiter.url = "localhost:6379".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_fixed_strategy_requires_fixed_provider() {
    let mut config = minimal_config();
    config.provider_selection.strategy = SelectionStrategy::Fixed;
    assert!(config.validate().is_err());

    config.provider_selection.fixed_provider = Some("openai".to_string());
    assert!(config.validate().is_ok());
}

#[test]
fn test_fixed_provider_outside_configured_providers_loads() {
    let config = AppConfig::from_toml(
        r#"
[provider_selection]
strategy = "FIXED"
fixed_provider = "mistral"

[providers.openai]
endpoint = "http://localhost:8082/analyze"
"#,
    )
    .unwrap();

    assert_eq!(
        config.provider_selection.fixed_provider.as_deref(),
        Some("mistral")
    );
    assert_eq!(config.available_providers(), vec!["openai"]);
}

#[test]
fn test_providers_keep_declaration_order() {
    let config = AppConfig::from_toml(
        r#"
[providers.openai]
endpoint = "http://localhost:8082/analyze"

[providers.gemini]
endpoint = "http://localhost:8081/analyze"

[providers.anthropic]
endpoint = "http://localhost:8083/analyze"
"#,
    )
    .unwrap();

    assert_eq!(
        config.available_providers(),
        vec!["openai", "gemini", "anthropic"]
    );

    let reparsed = AppConfig::from_toml(&config.to_toml().unwrap()).unwrap();
    assert_eq!(
        reparsed.available_providers(),
        vec!["openai", "gemini", "anthropic"]
    );
}

#[test]
fn test_weighted_strategy_requires_positive_total() {
    let mut config = minimal_config();
    config.provider_selection.strategy = SelectionStrategy::Weighted;
    assert!(config.validate().is_err());
}

#[test]
fn test_provider_without_queue_rejected() {
    let mut config = minimal_config();
    config.providers.insert(
        "mistral".to_string(),
        ProviderEndpointConfig::new("http://localhost:8083/analyze"),
    );
    let err = format!("{:#}", config.validate().unwrap_err());
    assert!(err.contains("mistral"));
}

#[test]
fn test_strategy_parsing() {
    assert_eq!(
        "cost_optimized".parse::<SelectionStrategy>().unwrap(),
        SelectionStrategy::CostOptimized
    );
    assert_eq!(
        "ROUND-ROBIN".parse::<SelectionStrategy>().unwrap(),
        SelectionStrategy::RoundRobin
    );
    assert!("RANDOM".parse::<SelectionStrategy>().is_err());
    assert_eq!(SelectionStrategy::QualityFirst.to_string(), "QUALITY_FIRST");
}

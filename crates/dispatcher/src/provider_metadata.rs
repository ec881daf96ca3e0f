use analysis_core::ProviderMetadata;
use std::collections::HashMap;

/// 内置的提供商价格和质量数据（美元/百万token）
pub fn default_provider_metadata() -> HashMap<String, ProviderMetadata> {
    [
        ProviderMetadata::new("gemini", 0.075, 0.30, 1.087, 7),
        ProviderMetadata::new("openai", 0.25, 2.00, 5.125, 8),
        ProviderMetadata::new("anthropic", 3.00, 15.00, 48.0, 10),
    ]
    .into_iter()
    .map(|meta| (meta.name.clone(), meta))
    .collect()
}

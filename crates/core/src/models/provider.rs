use serde::{Deserialize, Serialize};

/// AI提供商的成本与质量元数据
///
/// 价格单位为美元/百万token，`cost_per_million_tokens` 是选择器使用的综合成本，
/// `quality_score` 取值1-10。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetadata {
    pub name: String,
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
    pub cost_per_million_tokens: f64,
    pub quality_score: u8,
}

impl ProviderMetadata {
    pub fn new(
        name: impl Into<String>,
        input_cost_per_million: f64,
        output_cost_per_million: f64,
        cost_per_million_tokens: f64,
        quality_score: u8,
    ) -> Self {
        Self {
            name: name.into(),
            input_cost_per_million,
            output_cost_per_million,
            cost_per_million_tokens,
            quality_score,
        }
    }

    /// 合并部分更新，未提供的字段保持不变
    pub fn apply(&mut self, update: &ProviderMetadataUpdate) {
        if let Some(v) = update.input_cost_per_million {
            self.input_cost_per_million = v;
        }
        if let Some(v) = update.output_cost_per_million {
            self.output_cost_per_million = v;
        }
        if let Some(v) = update.cost_per_million_tokens {
            self.cost_per_million_tokens = v;
        }
        if let Some(v) = update.quality_score {
            self.quality_score = v;
        }
    }
}

/// 提供商元数据的部分更新
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderMetadataUpdate {
    #[serde(default, alias = "input_cost_per_million", skip_serializing_if = "Option::is_none")]
    pub input_cost_per_million: Option<f64>,
    #[serde(default, alias = "output_cost_per_million", skip_serializing_if = "Option::is_none")]
    pub output_cost_per_million: Option<f64>,
    #[serde(default, alias = "cost_per_million_tokens", skip_serializing_if = "Option::is_none")]
    pub cost_per_million_tokens: Option<f64>,
    #[serde(default, alias = "quality_score", skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<u8>,
}

impl ProviderMetadataUpdate {
    pub fn cost(cost_per_million_tokens: f64) -> Self {
        Self {
            cost_per_million_tokens: Some(cost_per_million_tokens),
            ..Default::default()
        }
    }

    pub fn quality(quality_score: u8) -> Self {
        Self {
            quality_score: Some(quality_score),
            ..Default::default()
        }
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::models::ProviderMetadataUpdate;

/// 提供商选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionStrategy {
    /// 总是使用 `fixed_provider`
    Fixed,
    /// 在可用提供商之间轮询
    #[default]
    RoundRobin,
    /// 综合成本最低者优先
    CostOptimized,
    /// 质量评分最高者优先
    QualityFirst,
    /// 使用消息中指定的提供商
    MessageBased,
    /// 按权重随机
    Weighted,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::Fixed => "FIXED",
            SelectionStrategy::RoundRobin => "ROUND_ROBIN",
            SelectionStrategy::CostOptimized => "COST_OPTIMIZED",
            SelectionStrategy::QualityFirst => "QUALITY_FIRST",
            SelectionStrategy::MessageBased => "MESSAGE_BASED",
            SelectionStrategy::Weighted => "WEIGHTED",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "FIXED" => Ok(SelectionStrategy::Fixed),
            "ROUND_ROBIN" => Ok(SelectionStrategy::RoundRobin),
            "COST_OPTIMIZED" => Ok(SelectionStrategy::CostOptimized),
            "QUALITY_FIRST" => Ok(SelectionStrategy::QualityFirst),
            "MESSAGE_BASED" => Ok(SelectionStrategy::MessageBased),
            "WEIGHTED" => Ok(SelectionStrategy::Weighted),
            other => Err(anyhow::anyhow!("未知的提供商选择策略: {other}")),
        }
    }
}

/// 单个提供商的权重（百分比）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderWeight {
    pub provider: String,
    pub weight: f64,
}

impl ProviderWeight {
    pub fn new(provider: impl Into<String>, weight: f64) -> Self {
        Self {
            provider: provider.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSelectionConfig {
    #[serde(default)]
    pub strategy: SelectionStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_provider: Option<String>,

    #[serde(default)]
    pub weights: Vec<ProviderWeight>,

    /// 启动时覆盖内置的提供商元数据
    #[serde(default)]
    pub metadata: BTreeMap<String, ProviderMetadataUpdate>,
}

impl ProviderSelectionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(w) = self.weights.iter().find(|w| w.weight < 0.0 || !w.weight.is_finite()) {
            return Err(anyhow::anyhow!("提供商 {} 的权重无效: {}", w.provider, w.weight));
        }

        match self.strategy {
            SelectionStrategy::Fixed => {
                if !matches!(self.fixed_provider.as_deref(), Some(p) if !p.is_empty()) {
                    return Err(anyhow::anyhow!("FIXED策略需要配置fixed_provider"));
                }
            }
            SelectionStrategy::Weighted => {
                let total: f64 = self.weights.iter().map(|w| w.weight).sum();
                if total <= 0.0 {
                    return Err(anyhow::anyhow!("WEIGHTED策略需要至少一个正权重"));
                }
            }
            SelectionStrategy::RoundRobin
            | SelectionStrategy::CostOptimized
            | SelectionStrategy::QualityFirst
            | SelectionStrategy::MessageBased => {}
        }

        Ok(())
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use analysis_core::config::{AppConfig, ProviderWeight, SelectionStrategy};
use analysis_core::{ProviderMetadata, ProviderMetadataUpdate, WorkerError, WorkerResult};

use crate::provider_metadata::default_provider_metadata;

/// 选择器配置
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    pub strategy: SelectionStrategy,
    pub fixed_provider: Option<String>,
    pub weights: Vec<ProviderWeight>,
    pub available_providers: Vec<String>,
}

impl SelectorConfig {
    pub fn new(strategy: SelectionStrategy, available_providers: Vec<String>) -> Self {
        Self {
            strategy,
            fixed_provider: None,
            weights: Vec::new(),
            available_providers,
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        let selection = &config.provider_selection;
        Self {
            strategy: selection.strategy,
            fixed_provider: selection.fixed_provider.clone(),
            weights: selection.weights.clone(),
            available_providers: config.available_providers(),
        }
    }

    pub fn validate(&self) -> WorkerResult<()> {
        if self.available_providers.is_empty() {
            return Err(WorkerError::config_error("至少需要一个可用的AI提供商"));
        }

        match self.strategy {
            SelectionStrategy::Fixed => {
                if !matches!(self.fixed_provider.as_deref(), Some(p) if !p.is_empty()) {
                    return Err(WorkerError::config_error("FIXED策略需要配置fixed_provider"));
                }
            }
            SelectionStrategy::Weighted => {
                if self.weights.is_empty() {
                    return Err(WorkerError::config_error("WEIGHTED策略需要配置权重"));
                }
                if let Some(w) = self.weights.iter().find(|w| w.weight < 0.0 || !w.weight.is_finite()) {
                    return Err(WorkerError::config_error(format!(
                        "提供商 {} 的权重无效: {}",
                        w.provider, w.weight
                    )));
                }
                let total: f64 = self.weights.iter().map(|w| w.weight).sum();
                if total <= 0.0 {
                    return Err(WorkerError::config_error("权重总和不能为0"));
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

/// 运行时策略更新，未设置的字段保持不变
#[derive(Debug, Clone, Default)]
pub struct StrategyUpdate {
    pub strategy: Option<SelectionStrategy>,
    pub fixed_provider: Option<String>,
    pub weights: Option<Vec<ProviderWeight>>,
    pub available_providers: Option<Vec<String>>,
}

/// 选择器状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorStats {
    pub strategy: SelectionStrategy,
    pub available_providers: Vec<String>,
    pub round_robin_index: usize,
    pub fixed_provider: Option<String>,
    pub weights: Vec<(String, f64)>,
}

struct SelectorState {
    config: SelectorConfig,
    metadata: HashMap<String, ProviderMetadata>,
}

/// AI提供商选择器
///
/// 配置和提供商元数据只通过本类型的方法修改，读多写少，使用读写锁保护。
pub struct ProviderSelector {
    state: RwLock<SelectorState>,
    round_robin_index: AtomicUsize,
}

impl ProviderSelector {
    pub fn new(config: SelectorConfig) -> WorkerResult<Self> {
        config.validate()?;

        info!(
            strategy = %config.strategy,
            providers = ?config.available_providers,
            "提供商选择器初始化完成"
        );

        Ok(Self {
            state: RwLock::new(SelectorState {
                config,
                metadata: default_provider_metadata(),
            }),
            round_robin_index: AtomicUsize::new(0),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, SelectorState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SelectorState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 为一个任务选择提供商，`hint` 是消息中指定的提供商
    pub fn select_provider(&self, hint: Option<&str>) -> String {
        let state = self.read();
        let config = &state.config;

        let selected = match config.strategy {
            SelectionStrategy::Fixed => self.select_fixed(config),
            SelectionStrategy::RoundRobin => self.select_round_robin(config),
            SelectionStrategy::CostOptimized => select_cheapest(config, &state.metadata),
            SelectionStrategy::QualityFirst => select_best_quality(config, &state.metadata),
            SelectionStrategy::MessageBased => select_from_hint(config, hint),
            SelectionStrategy::Weighted => {
                let draw = rand::rng().random_range(0.0..100.0);
                select_weighted(config, draw)
            }
        };

        debug!(strategy = %config.strategy, provider = %selected, "已选择提供商");
        selected
    }

    fn select_fixed(&self, config: &SelectorConfig) -> String {
        match config.fixed_provider.as_deref() {
            Some(fixed) if config.available_providers.iter().any(|p| p == fixed) => {
                fixed.to_string()
            }
            other => {
                warn!(
                    fixed_provider = ?other,
                    "固定提供商不在可用列表中，使用第一个可用提供商"
                );
                first_available(config)
            }
        }
    }

    fn select_round_robin(&self, config: &SelectorConfig) -> String {
        let providers = &config.available_providers;
        let index = self.round_robin_index.fetch_add(1, Ordering::Relaxed) % providers.len();
        providers[index].clone()
    }

    /// 部分更新策略配置；校验失败时保持原配置
    pub fn update_strategy(&self, update: StrategyUpdate) -> WorkerResult<()> {
        let mut state = self.write();

        let mut config = state.config.clone();
        if let Some(strategy) = update.strategy {
            config.strategy = strategy;
        }
        if let Some(fixed) = update.fixed_provider {
            config.fixed_provider = Some(fixed);
        }
        if let Some(weights) = update.weights {
            config.weights = weights;
        }
        if let Some(providers) = update.available_providers {
            config.available_providers = providers;
        }

        config.validate()?;

        info!(
            from = %state.config.strategy,
            to = %config.strategy,
            "提供商选择策略已更新"
        );
        state.config = config;
        Ok(())
    }

    /// 合并单个提供商的元数据，未知提供商返回false
    pub fn update_provider_metadata(
        &self,
        provider: &str,
        update: &ProviderMetadataUpdate,
    ) -> bool {
        let mut state = self.write();
        match state.metadata.get_mut(provider) {
            Some(meta) => {
                meta.apply(update);
                info!(provider, ?update, "提供商元数据已更新");
                true
            }
            None => {
                warn!(provider, "未知的提供商，忽略元数据更新");
                false
            }
        }
    }

    /// 批量应用元数据更新，例如来自配置文件或外部价格源
    pub fn load_metadata_from_config(&self, updates: &BTreeMap<String, ProviderMetadataUpdate>) {
        for (provider, update) in updates {
            self.update_provider_metadata(provider, update);
        }
        info!(count = updates.len(), "已从配置加载提供商元数据");
    }

    pub fn get_stats(&self) -> SelectorStats {
        let state = self.read();
        let config = &state.config;

        SelectorStats {
            strategy: config.strategy,
            available_providers: config.available_providers.clone(),
            round_robin_index: self.round_robin_index.load(Ordering::Relaxed),
            fixed_provider: config.fixed_provider.clone(),
            weights: config
                .weights
                .iter()
                .map(|w| (w.provider.clone(), w.weight))
                .collect(),
        }
    }

    pub fn get_provider_metadata(&self, provider: &str) -> Option<ProviderMetadata> {
        self.read().metadata.get(provider).cloned()
    }

    pub fn get_all_provider_metadata(&self) -> Vec<ProviderMetadata> {
        let mut all: Vec<ProviderMetadata> = self.read().metadata.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn available_providers(&self) -> Vec<String> {
        self.read().config.available_providers.clone()
    }
}

fn first_available(config: &SelectorConfig) -> String {
    config.available_providers[0].clone()
}

fn select_cheapest(config: &SelectorConfig, metadata: &HashMap<String, ProviderMetadata>) -> String {
    let cost = |provider: &str| {
        metadata
            .get(provider)
            .map_or(f64::INFINITY, |m| m.cost_per_million_tokens)
    };

    let mut best = &config.available_providers[0];
    for provider in &config.available_providers[1..] {
        if cost(provider) < cost(best) {
            best = provider;
        }
    }
    best.clone()
}

fn select_best_quality(
    config: &SelectorConfig,
    metadata: &HashMap<String, ProviderMetadata>,
) -> String {
    let quality = |provider: &str| metadata.get(provider).map_or(0, |m| m.quality_score);

    let mut best = &config.available_providers[0];
    for provider in &config.available_providers[1..] {
        if quality(provider) > quality(best) {
            best = provider;
        }
    }
    best.clone()
}

fn select_from_hint(config: &SelectorConfig, hint: Option<&str>) -> String {
    if let Some(hint) = hint {
        let normalized = hint.trim().to_lowercase();
        if let Some(provider) = config
            .available_providers
            .iter()
            .find(|p| p.to_lowercase() == normalized)
        {
            return provider.clone();
        }
        warn!(hint, "消息指定的提供商不可用，使用第一个可用提供商");
    } else {
        debug!("消息未指定提供商，使用第一个可用提供商");
    }
    first_available(config)
}

/// 把 `[0, 100)` 内的随机数映射到按配置顺序累积的归一化权重区间
pub(crate) fn select_weighted(config: &SelectorConfig, draw: f64) -> String {
    let total: f64 = config.weights.iter().map(|w| w.weight).sum();
    let mut cumulative = 0.0;

    for weight in &config.weights {
        cumulative += weight.weight / total * 100.0;
        if draw < cumulative && config.available_providers.contains(&weight.provider) {
            return weight.provider.clone();
        }
    }

    debug!(draw, "没有匹配的可用权重区间，使用第一个可用提供商");
    first_available(config)
}

pub mod provider_metadata;
pub mod provider_selector;


pub use provider_metadata::default_provider_metadata;
pub use provider_selector::{ProviderSelector, SelectorConfig, SelectorStats, StrategyUpdate};

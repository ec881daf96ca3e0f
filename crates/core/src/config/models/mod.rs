pub mod app_config;
pub mod message_queue;
pub mod observability;
pub mod provider_selection;
pub mod providers;
pub mod rate_limiter;
pub mod worker;

pub use app_config::AppConfig;
pub use message_queue::MessageQueueConfig;
pub use observability::{LogFormat, ObservabilityConfig};
pub use provider_selection::{ProviderSelectionConfig, ProviderWeight, SelectionStrategy};
pub use providers::ProviderEndpointConfig;
pub use rate_limiter::RateLimiterConfig;
pub use worker::WorkerConfig;

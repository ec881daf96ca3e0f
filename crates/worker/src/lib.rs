pub mod health;
pub mod provider_adapter;
pub mod service;

pub use health::{HealthMonitor, HealthReport};
pub use provider_adapter::{build_provider_adapters, HttpProviderAdapter};
pub use service::{DispatchService, DispatchStats};

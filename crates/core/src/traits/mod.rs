pub mod message_queue;
pub mod provider;
pub mod rate_limit_store;

pub use message_queue::*;
pub use provider::*;
pub use rate_limit_store::*;

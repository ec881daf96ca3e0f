pub mod message_queue;
pub mod rate_limiter;

pub use message_queue::*;
pub use rate_limiter::*;

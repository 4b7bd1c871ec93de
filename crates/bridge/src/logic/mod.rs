pub mod breaker;
pub mod cache;
pub mod client_session;
pub mod dispatch;
pub mod envelope;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod upstream;

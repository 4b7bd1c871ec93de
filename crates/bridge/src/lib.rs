pub mod logic;
pub mod router;
pub mod service;

#[cfg(all(test, feature = "unit_test"))]
pub mod test_support;

pub use service::{BridgeConfig, BridgeService};

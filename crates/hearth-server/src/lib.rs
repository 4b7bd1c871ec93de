pub mod factory;
pub mod router;
pub mod subsystems;

pub use factory::{ApiService, CreateApiServiceParams, create_api_service};

pub mod auth;
pub mod error_handling;
pub mod ip_rate_limiter;
pub mod metrics;
pub mod request_id;

pub use auth::auth_middleware;
pub use error_handling::{GatewayError, Result};
pub use ip_rate_limiter::{rate_limit_middleware, RateLimiter};
pub use metrics::{metrics_handler, metrics_middleware};
pub use request_id::request_id_middleware;

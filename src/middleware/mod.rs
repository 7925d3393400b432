pub mod cors;
pub mod identity;
pub mod rate_limit;
pub mod validation;

pub use cors::create_cors_layer;
pub use identity::{CallerId, StaffId};
pub use rate_limit::{rate_limit_middleware, RateLimitLayer};
pub use validation::ValidatedJson;

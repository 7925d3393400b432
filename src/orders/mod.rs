pub mod dispatch;
pub mod handlers;
pub mod models;
pub mod pricing;
pub mod service;
pub mod storage;

pub use dispatch::JobDispatcher;
pub use pricing::TokenPricing;
pub use service::OrderService;
pub use storage::UploadStorage;

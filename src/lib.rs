// Expose the modules
pub mod config;
pub mod domain;

// Re-export key types for easier usage
pub use config::{Config, ConfigError};
pub use domain::models::product::{PRODUCT_BINDING, PRODUCT_CREATED, PRODUCT_EXCHANGE, Product, ProductCreated};
pub use domain::services::catalog::{CatalogError, CatalogEvents, ProductCatalog, RetryPolicy};
pub use domain::services::notification::{
    Email, LogNotifier, NEW_PRODUCT_SUBJECT, Notifier, NotifyError, ProductNotificationHandler,
};

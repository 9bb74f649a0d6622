//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Producer side: the catalog stores products and announces them on the product exchange.
//
// | Component      | Description                                                     |
// |----------------|-----------------------------------------------------------------|
// | ProductCatalog | Creates and stores products                                     |
// | CatalogEvents  | Publishes `product.created` through an EventPublisher           |
// | RetryPolicy    | Exponential backoff with full jitter for transient failures     |
//--------------------------------------------------------------------------------------------------

mod product_catalog;
mod product_events;
mod retry;

#[cfg(test)]
mod tests;

pub use product_catalog::ProductCatalog;
pub use product_events::{CatalogError, CatalogEvents};
pub use retry::RetryPolicy;

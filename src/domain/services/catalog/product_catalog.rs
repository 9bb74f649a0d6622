use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use super::product_events::{CatalogError, CatalogEvents};
use crate::domain::models::product::Product;

/// In-memory product store that announces every new product
pub struct ProductCatalog {
    products: RwLock<HashMap<Uuid, Product>>,
    events: CatalogEvents,
}

impl ProductCatalog {
    pub fn new(events: CatalogEvents) -> Self {
        Self {
            products: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Stores the product, then publishes `product.created`.
    ///
    /// The product stays stored when publishing fails; the error is returned so the caller can
    /// decide whether to retry the announcement.
    pub async fn create_product(
        &self,
        name: &str,
        cost: Decimal,
        price: Decimal,
        image: Option<&str>,
    ) -> Result<Product, CatalogError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CatalogError::InvalidProduct("name cannot be empty".to_owned()));
        }
        if cost.is_sign_negative() || price.is_sign_negative() {
            return Err(CatalogError::InvalidProduct(format!(
                "cost ({cost}) and price ({price}) must not be negative"
            )));
        }

        let mut product = Product::new(name, cost, price);
        if let Some(image) = image {
            product = product.with_image(image);
        }
        self.products.write().insert(product.id, product.clone());
        info!("product {} created with id {}", product.name, product.id);

        if let Err(err) = self.events.product_created(&product).await {
            warn!("product {} stored but not announced: {}", product.id, err);
            return Err(err);
        }
        Ok(product)
    }

    pub fn get(&self, id: &Uuid) -> Option<Product> {
        self.products.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Product> {
        let mut products: Vec<Product> = self.products.read().values().cloned().collect();
        products.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        products
    }
}

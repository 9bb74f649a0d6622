use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Exchange every catalog event is published to
pub const PRODUCT_EXCHANGE: &str = "product.exchange";
/// Routing key of [`ProductCreated`]
pub const PRODUCT_CREATED: &str = "product.created";
/// Binding used by the notification consumer: every single-segment product event
pub const PRODUCT_BINDING: &str = "product.*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub cost: Decimal,
    pub price: Decimal,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn new(name: &str, cost: Decimal, price: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            cost,
            price,
            image: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.image = Some(image.to_owned());
        self
    }

    pub fn margin(&self) -> Decimal {
        self.price - self.cost
    }
}

/// Payload of the `product.created` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub product_id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
}

impl From<&Product> for ProductCreated {
    fn from(product: &Product) -> Self {
        Self {
            product_id: product.id,
            name: product.name.clone(),
            price: product.price,
            created_at: product.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_product_created_payload_round_trips_as_json() {
        let product = Product::new("Widget", dec!(1.20), dec!(2.50)).with_image("widget.png");
        assert_eq!(product.margin(), dec!(1.30));

        let payload = serde_json::to_vec(&ProductCreated::from(&product)).unwrap();
        let decoded: ProductCreated = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decoded.product_id, product.id);
        assert_eq!(decoded.name, "Widget");
        assert_eq!(decoded.price, dec!(2.50));
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Order Value Objects
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct OrderItem {
    pub product_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// No order has been placed under this identity yet.
    New,
    Created,
    Confirmed,
    Shipped,
    Delivered,
    Cancelled,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShippingQuote {
    pub destination: String,
    pub carrier: String,
    pub cost_cents: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_serialization() {
        let json = serde_json::to_string(&OrderStatus::Shipped).unwrap();
        let deserialized: OrderStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, OrderStatus::Shipped);
    }

    #[test]
    fn test_order_items_compare_by_value() {
        let product_id = Uuid::new_v4();
        let a = OrderItem { product_id, quantity: 2 };
        let b = OrderItem { product_id, quantity: 2 };
        assert_eq!(a, b);
        assert_ne!(a, OrderItem { product_id, quantity: 3 });
    }
}

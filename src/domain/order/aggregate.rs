use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::commands::OrderCommand;
use super::errors::OrderError;
use super::events::*;
use super::value_objects::{OrderItem, OrderStatus, ShippingQuote};
use crate::event_sourcing::core::Aggregate;

// ============================================================================
// Order Aggregate - State Derived From Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderAggregate {
    pub customer_id: Option<Uuid>,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    /// Home region first.
    pub regions: Vec<String>,

    pub created_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,

    pub quote: Option<ShippingQuote>,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub cancelled_reason: Option<String>,
}

impl Default for OrderAggregate {
    fn default() -> Self {
        Self {
            customer_id: None,
            items: Vec::new(),
            status: OrderStatus::New,
            regions: Vec::new(),
            created_at: None,
            confirmed_at: None,
            quote: None,
            tracking_number: None,
            carrier: None,
            cancelled_reason: None,
        }
    }
}

impl OrderAggregate {
    pub fn home_region(&self) -> Option<&str> {
        self.regions.first().map(String::as_str)
    }

    pub fn validate_items(items: &[OrderItem]) -> Result<(), OrderError> {
        if items.is_empty() {
            return Err(OrderError::EmptyItems);
        }
        match items.iter().find(|item| item.quantity <= 0) {
            Some(item) => Err(OrderError::InvalidQuantity(item.quantity)),
            None => Ok(()),
        }
    }

    /// Fails unless an order exists under this identity.
    pub fn require_created(&self) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::New => Err(OrderError::NotCreated),
            _ => Ok(()),
        }
    }
}

impl Aggregate for OrderAggregate {
    const AGGREGATE_TYPE: &'static str = "order";

    type Event = OrderEvent;
    type Command = OrderCommand;
    type Reply = OrderSummary;
    type Error = OrderError;

    fn initial() -> Self {
        Self::default()
    }

    fn apply(mut self, event: &OrderEvent) -> Self {
        match event {
            OrderEvent::Created(e) => {
                self.customer_id = Some(e.customer_id);
                self.items = e.items.clone();
                self.regions = e.regions.clone();
                self.status = OrderStatus::Created;
                self.created_at = Some(e.created_at);
            }
            OrderEvent::ItemsUpdated(e) => {
                self.items = e.items.clone();
                // The carrier priced the old contents.
                self.quote = None;
            }
            OrderEvent::Confirmed(e) => {
                self.status = OrderStatus::Confirmed;
                self.confirmed_at = Some(e.confirmed_at);
            }
            OrderEvent::ShippingQuoted(e) => {
                self.quote = Some(ShippingQuote {
                    destination: e.destination.clone(),
                    carrier: e.carrier.clone(),
                    cost_cents: e.cost_cents,
                });
            }
            OrderEvent::Shipped(e) => {
                self.status = OrderStatus::Shipped;
                self.tracking_number = Some(e.tracking_number.clone());
                self.carrier = Some(e.carrier.clone());
            }
            OrderEvent::Delivered(_) => self.status = OrderStatus::Delivered,
            OrderEvent::Cancelled(e) => {
                self.status = OrderStatus::Cancelled;
                self.cancelled_reason = e.reason.clone();
            }
            OrderEvent::HomeRegionAssigned(e) => self.regions = e.regions.clone(),
        }
        self
    }
}

/// What every order command answers with: the order after the command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderSummary {
    pub status: OrderStatus,
    pub item_count: usize,
    pub home_region: Option<String>,
    pub quote: Option<ShippingQuote>,
    pub tracking_number: Option<String>,
    /// Sequence number of the last event reflected in this summary.
    pub version: u64,
}

impl OrderSummary {
    pub fn of(order: &OrderAggregate, version: u64) -> Self {
        Self {
            status: order.status,
            item_count: order.items.iter().map(|i| i.quantity.max(0) as usize).sum(),
            home_region: order.home_region().map(str::to_string),
            quote: order.quote.clone(),
            tracking_number: order.tracking_number.clone(),
            version,
        }
    }
}

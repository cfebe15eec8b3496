use uuid::Uuid;

use super::value_objects::OrderItem;

#[derive(Debug, Clone)]
pub enum OrderCommand {
    CreateOrder {
        customer_id: Uuid,
        items: Vec<OrderItem>,
        /// Home region first, then the regions holding replicas.
        regions: Vec<String>,
    },
    UpdateItems {
        items: Vec<OrderItem>,
        reason: Option<String>,
    },
    ConfirmOrder,
    /// Ask the carrier for a price; answered asynchronously.
    QuoteShipping {
        destination: String,
    },
    ShipOrder {
        tracking_number: String,
        carrier: String,
    },
    DeliverOrder {
        signature: Option<String>,
    },
    CancelOrder {
        reason: Option<String>,
        cancelled_by: Option<Uuid>,
    },
    GetSummary,
}

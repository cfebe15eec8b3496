use super::value_objects::OrderStatus;

// ============================================================================
// Order Business Rule Errors
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OrderError {
    #[error("Order does not exist")]
    NotCreated,

    #[error("Order already exists for another customer")]
    AlreadyCreated,

    #[error("Order is already cancelled")]
    AlreadyCancelled,

    #[error("Order must be confirmed before shipping")]
    NotConfirmed,

    #[error("Order must be shipped before delivery")]
    NotShipped,

    #[error("Cannot modify order in status: {0:?}")]
    InvalidStatusTransition(OrderStatus),

    #[error("Order items cannot be empty")]
    EmptyItems,

    #[error("Invalid item quantity: {0}")]
    InvalidQuantity(i32),

    #[error("Order must name at least its home region")]
    NoRegions,

    #[error("Shipping quote unavailable: {0}")]
    QuoteUnavailable(String),
}

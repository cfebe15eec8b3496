use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::aggregate::{OrderAggregate, OrderSummary};
use super::commands::OrderCommand;
use super::errors::OrderError;
use super::events::*;
use super::value_objects::{OrderItem, OrderStatus, ShippingQuote};
use crate::event_sourcing::core::{Aggregate, CommandContext, CommandHandler, Emission, HandlerChain};

// ============================================================================
// Order Command Handlers
// ============================================================================
//
// One handler per command, chained in this order:
//
//   create -> update items -> confirm -> quote shipping (async)
//          -> ship -> deliver -> cancel -> summary (read-only)
//
// Every write is idempotent: re-sending a command whose effect is already
// in the state answers with the current summary and emits nothing.
//
// ============================================================================

pub fn order_handlers(rates: Arc<dyn ShippingRates>) -> HandlerChain<OrderAggregate> {
    HandlerChain::new()
        .with(CreateOrderHandler)
        .with(UpdateItemsHandler)
        .with(ConfirmOrderHandler)
        .with(QuoteShippingHandler { rates })
        .with(ShipOrderHandler)
        .with(DeliverOrderHandler)
        .with(CancelOrderHandler)
        .with(SummaryHandler)
}

/// The order after `events`, as a reply.
fn summarize(ctx: &CommandContext<'_, OrderAggregate>, events: &[OrderEvent]) -> OrderSummary {
    let order = events.iter().fold(ctx.state.clone(), |order, event| order.apply(event));
    OrderSummary::of(&order, ctx.last_sequence + events.len() as u64)
}

/// Prices a shipment. Implementations call out to a carrier.
#[async_trait]
pub trait ShippingRates: Send + Sync + 'static {
    async fn quote(&self, destination: &str, items: &[OrderItem]) -> Result<ShippingQuote, String>;
}

/// Base price plus a per-unit price, after a fixed carrier latency.
pub struct FlatRateShipping {
    pub carrier: String,
    pub base_cents: u64,
    pub per_unit_cents: u64,
    pub latency: Duration,
}

impl Default for FlatRateShipping {
    fn default() -> Self {
        Self {
            carrier: "postal".to_string(),
            base_cents: 499,
            per_unit_cents: 150,
            latency: Duration::from_millis(200),
        }
    }
}

#[async_trait]
impl ShippingRates for FlatRateShipping {
    async fn quote(&self, destination: &str, items: &[OrderItem]) -> Result<ShippingQuote, String> {
        tokio::time::sleep(self.latency).await;
        if destination.trim().is_empty() {
            return Err("no destination".to_string());
        }
        let units: u64 = items.iter().map(|i| i.quantity.max(0) as u64).sum();
        Ok(ShippingQuote {
            destination: destination.to_string(),
            carrier: self.carrier.clone(),
            cost_cents: self.base_cents + units * self.per_unit_cents,
        })
    }
}

pub struct CreateOrderHandler;

impl CommandHandler<OrderAggregate> for CreateOrderHandler {
    fn can_handle(&self, command: &OrderCommand) -> bool {
        matches!(command, OrderCommand::CreateOrder { .. })
    }

    fn validate(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Result<(), OrderError> {
        let OrderCommand::CreateOrder { customer_id, items, regions } = ctx.command else {
            return Ok(());
        };
        if ctx.state.status != OrderStatus::New {
            // A re-sent create is answered idempotently.
            if ctx.state.customer_id == Some(*customer_id) {
                return Ok(());
            }
            return Err(OrderError::AlreadyCreated);
        }
        if regions.is_empty() {
            return Err(OrderError::NoRegions);
        }
        OrderAggregate::validate_items(items)
    }

    fn is_already_applied(&self, ctx: &CommandContext<'_, OrderAggregate>) -> bool {
        ctx.state.status != OrderStatus::New
    }

    fn events_to_emit(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Emission<OrderAggregate> {
        match ctx.command {
            OrderCommand::CreateOrder { customer_id, items, regions } => {
                Emission::one(OrderEvent::Created(OrderCreated {
                    customer_id: *customer_id,
                    items: items.clone(),
                    regions: regions.clone(),
                    created_at: Utc::now(),
                }))
            }
            _ => Emission::none(),
        }
    }

    fn reply(&self, ctx: &CommandContext<'_, OrderAggregate>, events: &[OrderEvent]) -> OrderSummary {
        summarize(ctx, events)
    }
}

pub struct UpdateItemsHandler;

impl CommandHandler<OrderAggregate> for UpdateItemsHandler {
    fn can_handle(&self, command: &OrderCommand) -> bool {
        matches!(command, OrderCommand::UpdateItems { .. })
    }

    fn validate(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Result<(), OrderError> {
        ctx.state.require_created()?;
        match ctx.state.status {
            OrderStatus::Created => {}
            OrderStatus::Cancelled => return Err(OrderError::AlreadyCancelled),
            status => return Err(OrderError::InvalidStatusTransition(status)),
        }
        match ctx.command {
            OrderCommand::UpdateItems { items, .. } => OrderAggregate::validate_items(items),
            _ => Ok(()),
        }
    }

    fn is_already_applied(&self, ctx: &CommandContext<'_, OrderAggregate>) -> bool {
        matches!(ctx.command, OrderCommand::UpdateItems { items, .. } if *items == ctx.state.items)
    }

    fn events_to_emit(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Emission<OrderAggregate> {
        match ctx.command {
            OrderCommand::UpdateItems { items, reason } => {
                Emission::one(OrderEvent::ItemsUpdated(OrderItemsUpdated {
                    items: items.clone(),
                    reason: reason.clone(),
                }))
            }
            _ => Emission::none(),
        }
    }

    fn reply(&self, ctx: &CommandContext<'_, OrderAggregate>, events: &[OrderEvent]) -> OrderSummary {
        summarize(ctx, events)
    }
}

pub struct ConfirmOrderHandler;

impl CommandHandler<OrderAggregate> for ConfirmOrderHandler {
    fn can_handle(&self, command: &OrderCommand) -> bool {
        matches!(command, OrderCommand::ConfirmOrder)
    }

    fn validate(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Result<(), OrderError> {
        ctx.state.require_created()?;
        match ctx.state.status {
            OrderStatus::Created | OrderStatus::Confirmed => Ok(()),
            OrderStatus::Cancelled => Err(OrderError::AlreadyCancelled),
            status => Err(OrderError::InvalidStatusTransition(status)),
        }
    }

    fn is_already_applied(&self, ctx: &CommandContext<'_, OrderAggregate>) -> bool {
        ctx.state.status == OrderStatus::Confirmed
    }

    fn events_to_emit(&self, _ctx: &CommandContext<'_, OrderAggregate>) -> Emission<OrderAggregate> {
        Emission::one(OrderEvent::Confirmed(OrderConfirmed {
            confirmed_at: Utc::now(),
        }))
    }

    fn reply(&self, ctx: &CommandContext<'_, OrderAggregate>, events: &[OrderEvent]) -> OrderSummary {
        summarize(ctx, events)
    }
}

pub struct QuoteShippingHandler {
    rates: Arc<dyn ShippingRates>,
}

impl CommandHandler<OrderAggregate> for QuoteShippingHandler {
    fn can_handle(&self, command: &OrderCommand) -> bool {
        matches!(command, OrderCommand::QuoteShipping { .. })
    }

    fn validate(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Result<(), OrderError> {
        ctx.state.require_created()?;
        match ctx.state.status {
            OrderStatus::Created | OrderStatus::Confirmed => Ok(()),
            OrderStatus::Cancelled => Err(OrderError::AlreadyCancelled),
            status => Err(OrderError::InvalidStatusTransition(status)),
        }
    }

    fn is_already_applied(&self, ctx: &CommandContext<'_, OrderAggregate>) -> bool {
        match (ctx.command, &ctx.state.quote) {
            (OrderCommand::QuoteShipping { destination }, Some(quote)) => quote.destination == *destination,
            _ => false,
        }
    }

    fn events_to_emit(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Emission<OrderAggregate> {
        let OrderCommand::QuoteShipping { destination } = ctx.command else {
            return Emission::none();
        };
        let rates = self.rates.clone();
        let destination = destination.clone();
        let items = ctx.state.items.clone();

        Emission::Later(Box::pin(async move {
            let quote = rates
                .quote(&destination, &items)
                .await
                .map_err(OrderError::QuoteUnavailable)?;
            Ok(vec![OrderEvent::ShippingQuoted(ShippingQuoted {
                destination: quote.destination,
                carrier: quote.carrier,
                cost_cents: quote.cost_cents,
            })])
        }))
    }

    fn reply(&self, ctx: &CommandContext<'_, OrderAggregate>, events: &[OrderEvent]) -> OrderSummary {
        summarize(ctx, events)
    }
}

pub struct ShipOrderHandler;

impl CommandHandler<OrderAggregate> for ShipOrderHandler {
    fn can_handle(&self, command: &OrderCommand) -> bool {
        matches!(command, OrderCommand::ShipOrder { .. })
    }

    fn validate(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Result<(), OrderError> {
        ctx.state.require_created()?;
        match ctx.state.status {
            OrderStatus::Confirmed => Ok(()),
            OrderStatus::Created => Err(OrderError::NotConfirmed),
            OrderStatus::Shipped if self.is_already_applied(ctx) => Ok(()),
            status => Err(OrderError::InvalidStatusTransition(status)),
        }
    }

    fn is_already_applied(&self, ctx: &CommandContext<'_, OrderAggregate>) -> bool {
        match ctx.command {
            OrderCommand::ShipOrder { tracking_number, .. } => {
                ctx.state.status == OrderStatus::Shipped
                    && ctx.state.tracking_number.as_deref() == Some(tracking_number.as_str())
            }
            _ => false,
        }
    }

    fn events_to_emit(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Emission<OrderAggregate> {
        match ctx.command {
            OrderCommand::ShipOrder { tracking_number, carrier } => {
                Emission::one(OrderEvent::Shipped(OrderShipped {
                    tracking_number: tracking_number.clone(),
                    carrier: carrier.clone(),
                    shipped_at: Utc::now(),
                }))
            }
            _ => Emission::none(),
        }
    }

    fn reply(&self, ctx: &CommandContext<'_, OrderAggregate>, events: &[OrderEvent]) -> OrderSummary {
        summarize(ctx, events)
    }
}

pub struct DeliverOrderHandler;

impl CommandHandler<OrderAggregate> for DeliverOrderHandler {
    fn can_handle(&self, command: &OrderCommand) -> bool {
        matches!(command, OrderCommand::DeliverOrder { .. })
    }

    fn validate(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Result<(), OrderError> {
        ctx.state.require_created()?;
        match ctx.state.status {
            OrderStatus::Shipped | OrderStatus::Delivered => Ok(()),
            _ => Err(OrderError::NotShipped),
        }
    }

    fn is_already_applied(&self, ctx: &CommandContext<'_, OrderAggregate>) -> bool {
        ctx.state.status == OrderStatus::Delivered
    }

    fn events_to_emit(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Emission<OrderAggregate> {
        match ctx.command {
            OrderCommand::DeliverOrder { signature } => {
                Emission::one(OrderEvent::Delivered(OrderDelivered {
                    delivered_at: Utc::now(),
                    signature: signature.clone(),
                }))
            }
            _ => Emission::none(),
        }
    }

    fn reply(&self, ctx: &CommandContext<'_, OrderAggregate>, events: &[OrderEvent]) -> OrderSummary {
        summarize(ctx, events)
    }
}

pub struct CancelOrderHandler;

impl CommandHandler<OrderAggregate> for CancelOrderHandler {
    fn can_handle(&self, command: &OrderCommand) -> bool {
        matches!(command, OrderCommand::CancelOrder { .. })
    }

    fn validate(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Result<(), OrderError> {
        ctx.state.require_created()?;
        match ctx.state.status {
            OrderStatus::Delivered => Err(OrderError::InvalidStatusTransition(OrderStatus::Delivered)),
            // Created, Confirmed, Shipped; Cancelled is answered idempotently.
            _ => Ok(()),
        }
    }

    fn is_already_applied(&self, ctx: &CommandContext<'_, OrderAggregate>) -> bool {
        ctx.state.status == OrderStatus::Cancelled
    }

    fn events_to_emit(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Emission<OrderAggregate> {
        match ctx.command {
            OrderCommand::CancelOrder { reason, cancelled_by } => {
                Emission::one(OrderEvent::Cancelled(OrderCancelled {
                    reason: reason.clone(),
                    cancelled_by: *cancelled_by,
                }))
            }
            _ => Emission::none(),
        }
    }

    fn reply(&self, ctx: &CommandContext<'_, OrderAggregate>, events: &[OrderEvent]) -> OrderSummary {
        summarize(ctx, events)
    }
}

/// Read-only; served by replicas too.
pub struct SummaryHandler;

impl CommandHandler<OrderAggregate> for SummaryHandler {
    fn can_handle(&self, command: &OrderCommand) -> bool {
        matches!(command, OrderCommand::GetSummary)
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn validate(&self, ctx: &CommandContext<'_, OrderAggregate>) -> Result<(), OrderError> {
        ctx.state.require_created()
    }

    fn events_to_emit(&self, _ctx: &CommandContext<'_, OrderAggregate>) -> Emission<OrderAggregate> {
        Emission::none()
    }

    fn reply(&self, ctx: &CommandContext<'_, OrderAggregate>, events: &[OrderEvent]) -> OrderSummary {
        summarize(ctx, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use crate::actors::AggregateRegistry;
    use crate::domain::order::OrderReplicationPolicy;
    use crate::error::CommandError;
    use crate::event_sourcing::{EventLog, InMemoryEventLog};
    use crate::metrics::Metrics;
    use crate::replication::{CoordinatorSettings, EventEnvelope};

    fn shop(log: Arc<InMemoryEventLog>, local: &str, latency: Duration) -> AggregateRegistry<OrderAggregate> {
        let rates = FlatRateShipping {
            latency,
            ..FlatRateShipping::default()
        };
        let settings = CoordinatorSettings {
            log,
            handlers: Arc::new(order_handlers(Arc::new(rates))),
            policy: Arc::new(OrderReplicationPolicy::new(["us"])),
            local_region: local.to_string(),
            max_pending_envelopes: 16,
            metrics: Arc::new(Metrics::new().unwrap()),
        };
        AggregateRegistry::new(settings, Duration::from_secs(60), Duration::from_secs(5))
    }

    fn create(customer_id: Uuid) -> OrderCommand {
        OrderCommand::CreateOrder {
            customer_id,
            items: vec![OrderItem { product_id: Uuid::nil(), quantity: 2 }],
            regions: vec!["eu".into(), "us".into()],
        }
    }

    #[tokio::test]
    async fn test_order_lifecycle() {
        let log = Arc::new(InMemoryEventLog::new());
        let orders = shop(log.clone(), "eu", Duration::ZERO);
        let customer = Uuid::new_v4();

        let (order_id, summary) = orders.create(create(customer)).await.unwrap();
        assert_eq!(order_id.region(), Some("eu"));
        assert_eq!(summary.status, OrderStatus::Created);
        assert_eq!(summary.home_region.as_deref(), Some("eu"));
        assert_eq!(summary.version, 1);

        let id = order_id.as_str();
        orders.execute(id, OrderCommand::ConfirmOrder).await.unwrap();
        let summary = orders
            .execute(
                id,
                OrderCommand::ShipOrder {
                    tracking_number: "TRK-9".into(),
                    carrier: "dhl".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(summary.status, OrderStatus::Shipped);
        assert_eq!(summary.version, 3);

        let history = log.replay(id).await.unwrap();
        assert!(history.iter().all(|e| e.has_tag("order@us")));
    }

    #[tokio::test]
    async fn test_business_rules_reject_invalid_transitions() {
        let orders = shop(Arc::new(InMemoryEventLog::new()), "eu", Duration::ZERO);
        orders.execute("eu:o1", create(Uuid::new_v4())).await.unwrap();

        let result = orders
            .execute("eu:o1", OrderCommand::DeliverOrder { signature: None })
            .await;
        assert!(matches!(result, Err(CommandError::Rejected(OrderError::NotShipped))));

        let result = orders.execute("eu:o1", create(Uuid::new_v4())).await;
        assert!(matches!(result, Err(CommandError::Rejected(OrderError::AlreadyCreated))));
    }

    #[tokio::test]
    async fn test_resent_commands_are_idempotent() {
        let log = Arc::new(InMemoryEventLog::new());
        let orders = shop(log.clone(), "eu", Duration::ZERO);
        let customer = Uuid::new_v4();

        orders.execute("eu:o1", create(customer)).await.unwrap();
        let again = orders.execute("eu:o1", create(customer)).await.unwrap();
        assert_eq!(again.version, 1);

        orders.execute("eu:o1", OrderCommand::ConfirmOrder).await.unwrap();
        orders.execute("eu:o1", OrderCommand::ConfirmOrder).await.unwrap();
        assert_eq!(log.len("eu:o1").await, 2);
    }

    #[tokio::test]
    async fn test_shipping_quote_is_computed_asynchronously() {
        let log = Arc::new(InMemoryEventLog::new());
        let orders = shop(log.clone(), "eu", Duration::from_millis(200));
        orders.execute("eu:o1", create(Uuid::new_v4())).await.unwrap();

        let quoting = {
            let orders = orders.clone();
            tokio::spawn(async move {
                orders
                    .execute("eu:o1", OrderCommand::QuoteShipping { destination: "Lyon".into() })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The aggregate keeps serving while the carrier is being asked.
        let started = tokio::time::Instant::now();
        orders.execute("eu:o1", OrderCommand::GetSummary).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(150));

        let summary = quoting.await.unwrap().unwrap();
        let quote = summary.quote.unwrap();
        assert_eq!(quote.destination, "Lyon");
        assert_eq!(quote.cost_cents, 499 + 2 * 150);
        assert_eq!(log.len("eu:o1").await, 2);
    }

    #[tokio::test]
    async fn test_replica_serves_reads_and_refuses_writes() {
        let eu_log = Arc::new(InMemoryEventLog::new());
        let eu = shop(eu_log.clone(), "eu", Duration::ZERO);
        let us = shop(Arc::new(InMemoryEventLog::new()), "us", Duration::ZERO);

        eu.execute("eu:o1", create(Uuid::new_v4())).await.unwrap();
        eu.execute("eu:o1", OrderCommand::ConfirmOrder).await.unwrap();
        for event in eu_log.replay("eu:o1").await.unwrap() {
            us.replicate(EventEnvelope::from_persisted(&event)).await.unwrap();
        }

        let summary = us.execute("eu:o1", OrderCommand::GetSummary).await.unwrap();
        assert_eq!(summary.status, OrderStatus::Confirmed);

        let result = us.execute("eu:o1", OrderCommand::CancelOrder { reason: None, cancelled_by: None }).await;
        assert!(matches!(
            result,
            Err(CommandError::NotPrimary { primary: Some(ref region) }) if region == "eu"
        ));
    }
}

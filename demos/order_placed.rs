use herald::{BusConfig, DomainEvent, EventBus, EventHandler, HandlerError, async_trait};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct Order {
    id: u32,
    audited: bool,
}

struct AuditHandler;

#[async_trait]
impl EventHandler<Order, String> for AuditHandler {
    async fn handle(&self, event: &mut DomainEvent<'_, Order, String>) -> Result<(), HandlerError> {
        println!("audit: order {}", event.payload().id);
        event.payload_mut().audited = true;
        Ok(())
    }
}

struct BillingHandler;

#[async_trait]
impl EventHandler<Order, String> for BillingHandler {
    async fn handle(&self, event: &mut DomainEvent<'_, Order, String>) -> Result<(), HandlerError> {
        if !event.payload().audited {
            return Err("refusing to bill an unaudited order".into());
        }
        println!("billing: order {}", event.payload().id);
        event.set_result(format!("billed #{}", event.payload().id));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .init();

    let bus = EventBus::<Order, String>::new(BusConfig::new(4)?);
    // Registered out of order; the chain runs by type name.
    bus.register_typed("orderPlaced", BillingHandler)?;
    bus.register_typed("orderPlaced", AuditHandler)?;
    bus.start()?;

    let mut receipts = Vec::new();
    for id in 40..46 {
        receipts.push(bus.publish_async("orderPlaced", Order { id, audited: false }).await?);
    }
    for receipt in &receipts {
        println!("result: {:?}", receipt.get_timeout(Duration::from_secs(1)).await?);
    }

    // Nobody listens; this only logs a warning.
    bus.publish("orderShipped", Order { id: 40, audited: true }).await?;

    bus.stop().await;
    Ok(())
}

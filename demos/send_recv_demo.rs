// demos/send_recv_demo.rs
//
// Runs entirely in-process over the memory broker.
use anyhow::Result;
use rabrpc::{Actions, MemoryBroker, RabRpc, SimplifiedConfig};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct OrderMessage {
    order_id: String,
    items: Vec<String>,
    total: f64,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let broker = MemoryBroker::new();
    let rpc = RabRpc::new(Arc::new(broker.clone()));
    rpc.configure(
        &SimplifiedConfig::new("memory://local")
            .send("orders")
            .recv("orders")
            .publish("orders")
            .subscribe("orders"),
    )
    .await?;

    // Fails on the first delivery to show redelivery.
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    rpc.receive("v1.orders.place", move |order: OrderMessage, _: Actions, topic: String| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if attempt == 1 {
                anyhow::bail!("warehouse not ready");
            }
            info!(%topic, order_id = %order.order_id, total = order.total, "Order placed");
            Ok(())
        }
    })?;

    rpc.subscribe("v1.orders.shipped", |order_id: String, _: Actions, _: String| async move {
        info!(%order_id, "Order shipped");
        Ok(())
    })?;

    rpc.send(
        "v1.orders.place",
        &OrderMessage {
            order_id: "A-100".into(),
            items: vec!["keyboard".into(), "mouse".into()],
            total: 74.5,
            timestamp: chrono::Utc::now(),
        },
    )
    .await?;
    rpc.publish("v1.orders.shipped", "A-100").await?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("{:?}", broker.stats());

    rpc.shutdown().await?;
    Ok(())
}

use rabrpc::{Actions, SimplifiedConfig};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use crate::common::{eventually, memory_rpc};

#[tokio::test]
async fn every_subscriber_queue_gets_a_copy() {
    let (rpc, broker) = memory_rpc(
        SimplifiedConfig::new("memory")
            .name("audit")
            .subscribe("orders"),
    )
    .await;
    // A second service subscribing to the same publisher.
    rpc.configure(
        &SimplifiedConfig::new("memory")
            .name("mailer")
            .subscribe("orders"),
    )
    .await
    .unwrap();
    // And the publishing side.
    rpc.configure(&SimplifiedConfig::new("memory").name("orders").publish("orders"))
        .await
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    rpc.subscribe("v1.orders.created", move |event: Value, _: Actions, _: String| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(event);
            Ok(())
        }
    })
    .unwrap();

    rpc.publish("v1.orders.created", &json!({ "order": "A-1" }))
        .await
        .unwrap();

    assert!(eventually(|| async { broker.stats().acked == 2 }).await);
    assert_eq!(
        received.lock().unwrap().clone(),
        vec![json!({ "order": "A-1" }), json!({ "order": "A-1" })]
    );

    let audit = broker.configuration("audit").unwrap();
    assert_eq!(audit.queues[0].name, "pub-sub.orders.audit");
}

#[tokio::test]
async fn publishing_without_subscribers_is_confirmed() {
    let (rpc, broker) = memory_rpc(SimplifiedConfig::new("memory").publish("news")).await;

    rpc.publish("v1.news.posted", &json!({ "title": "hello" }))
        .await
        .unwrap();

    assert_eq!(broker.published().len(), 1);
    assert_eq!(broker.stats().delivered, 0);
}

#[tokio::test]
async fn cancelled_subscription_stops_handling() {
    let (rpc, broker) = memory_rpc(SimplifiedConfig::new("memory").subscribe("news")).await;
    let subscription = rpc
        .subscribe("v1.news.posted", |_: Value, _: Actions, _: String| async { Ok(()) })
        .unwrap();

    assert!(subscription.cancel());
    rpc.publish("v1.news.posted", &json!({})).await.unwrap();

    assert!(eventually(|| async { broker.stats().unhandled == 1 }).await);
    assert_eq!(broker.stats().acked, 0);
}

use rabrpc::{Actions, CallOptions, RabRpcError, SimplifiedConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::{eventually, memory_rpc};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Shipment {
    order_id: String,
    items: Vec<String>,
}

#[tokio::test]
async fn receiver_gets_payload_and_topic() {
    let (rpc, broker) = memory_rpc(SimplifiedConfig::new("memory").recv("shipping")).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    rpc.receive("v1.shipping.create", move |shipment: Shipment, _: Actions, topic: String| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push((shipment, topic));
            Ok(())
        }
    })
    .unwrap();

    let shipment = Shipment {
        order_id: "A-1".into(),
        items: vec!["book".into()],
    };
    rpc.send("v1.shipping.create", &shipment).await.unwrap();

    assert!(eventually(|| async { broker.stats().acked == 1 }).await);
    assert_eq!(
        seen.lock().unwrap().clone(),
        vec![(shipment, "v1.shipping.create".to_string())]
    );

    let (exchange, message) = broker.published().remove(0);
    assert_eq!(exchange, "send-recv.shipping");
    assert_eq!(message.routing_key, "shipping");
    assert!(message.persistent);
}

#[tokio::test]
async fn failing_handler_is_redelivered_until_it_succeeds() {
    let (rpc, broker) = memory_rpc(SimplifiedConfig::new("memory").recv("jobs")).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    rpc.receive("v1.jobs.run", move |_: Value, _: Actions, _: String| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if attempt < 3 {
                anyhow::bail!("attempt {} failed", attempt);
            }
            Ok(())
        }
    })
    .unwrap();

    rpc.send("v1.jobs.run", &json!({ "id": 1 })).await.unwrap();

    assert!(eventually(|| async { broker.stats().acked == 1 }).await);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let stats = broker.stats();
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.rejected, 0);
}

#[tokio::test]
async fn handler_can_reject_explicitly() {
    let (rpc, broker) = memory_rpc(SimplifiedConfig::new("memory").recv("jobs")).await;
    rpc.receive("v1.jobs.run", |_: Value, actions: Actions, _: String| async move {
        actions.reject().await?;
        Ok(())
    })
    .unwrap();

    rpc.send("v1.jobs.run", &json!(null)).await.unwrap();

    assert!(eventually(|| async { broker.stats().rejected == 1 }).await);
    assert_eq!(broker.stats().acked, 0);
}

#[tokio::test]
async fn undecodable_payload_is_rejected_without_calling_handler() {
    let (rpc, broker) = memory_rpc(SimplifiedConfig::new("memory").recv("shipping")).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    rpc.receive("v1.shipping.create", move |_: Shipment, _: Actions, _: String| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    })
    .unwrap();

    rpc.send("v1.shipping.create", &json!({ "order_id": 7 })).await.unwrap();

    assert!(eventually(|| async { broker.stats().rejected == 1 }).await);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stopped_subscription_holds_messages() {
    let (rpc, broker) = memory_rpc(SimplifiedConfig::new("memory").recv("jobs")).await;
    rpc.receive("v1.jobs.run", |_: Value, _: Actions, _: String| async { Ok(()) })
        .unwrap();

    rpc.stop_subscription("send-recv.jobs", None).await.unwrap();
    rpc.send("v1.jobs.run", &json!(1)).await.unwrap();

    assert_eq!(broker.parked("send-recv.jobs"), 1);
    assert_eq!(broker.stats().delivered, 0);
}

#[tokio::test]
async fn sending_to_an_unconfigured_service_fails() {
    let (rpc, _) = memory_rpc(SimplifiedConfig::new("memory").send("jobs")).await;

    let err = rpc.send("v1.billing.charge", &json!({})).await.unwrap_err();
    assert!(matches!(err, RabRpcError::Publish(_)));
}

#[tokio::test]
async fn negative_confirm_is_reported() {
    let (rpc, broker) = memory_rpc(SimplifiedConfig::new("memory").send("jobs")).await;
    broker.refuse_next_publish();

    let err = rpc
        .send_with("v1.jobs.run", &json!({}), &CallOptions::default().transient())
        .await
        .unwrap_err();
    assert!(matches!(err, RabRpcError::NotDelivered(_)));
}

#[tokio::test]
async fn messages_sent_before_receive_reach_the_late_handler() {
    let (rpc, broker) = memory_rpc(SimplifiedConfig::new("memory").recv("jobs")).await;

    rpc.send("v1.jobs.run", &json!({ "id": 7 })).await.unwrap();
    assert_eq!(broker.stats().unhandled, 1);
    assert_eq!(broker.parked("send-recv.jobs"), 1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    rpc.receive("v1.jobs.run", move |job: Value, _: Actions, _: String| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().unwrap().push(job);
            Ok(())
        }
    })
    .unwrap();

    assert!(eventually(|| async { broker.stats().acked == 1 }).await);
    assert_eq!(seen.lock().unwrap().clone(), vec![json!({ "id": 7 })]);
    assert_eq!(broker.parked("send-recv.jobs"), 0);
}

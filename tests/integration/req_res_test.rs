use rabrpc::{Actions, CallOptions, RabRpcError, ServiceOptions, SimplifiedConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use crate::common::memory_rpc;

#[derive(Debug, Serialize, Deserialize)]
struct InventoryRequest {
    product_id: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct InventoryResponse {
    product_id: String,
    quantity: i32,
    available: bool,
}

#[tokio::test]
async fn request_round_trip() {
    let (rpc, _) = memory_rpc(SimplifiedConfig::new("memory").res("inventory")).await;
    rpc.respond("v1.inventory.check", |req: InventoryRequest, _: Actions, _: String| async move {
        Ok(InventoryResponse {
            quantity: if req.product_id == "P-1" { 4 } else { 0 },
            available: req.product_id == "P-1",
            product_id: req.product_id,
        })
    })
    .unwrap();

    let response: InventoryResponse = rpc
        .request(
            "v1.inventory.check",
            &InventoryRequest {
                product_id: "P-1".into(),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        response,
        InventoryResponse {
            product_id: "P-1".into(),
            quantity: 4,
            available: true,
        }
    );
}

#[tokio::test]
async fn responder_failure_becomes_request_error() {
    let (rpc, _) = memory_rpc(SimplifiedConfig::new("memory").res("users")).await;
    rpc.respond("v1.users.get", |_: Value, _: Actions, _: String| async {
        Err::<Value, _>(anyhow::anyhow!("user not found"))
    })
    .unwrap();

    let err = rpc
        .request::<_, Value>("v1.users.get", &json!({ "id": 9 }))
        .await
        .unwrap_err();
    assert!(matches!(err, RabRpcError::Request(ref msg) if msg == "user not found"));
}

#[tokio::test]
async fn request_without_responder_times_out() {
    let (rpc, _) = memory_rpc(SimplifiedConfig::new("memory").req("users")).await;

    let started = Instant::now();
    let err = rpc
        .request_with::<_, Value>(
            "v1.users.get",
            &json!({}),
            &CallOptions::default().with_reply_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RabRpcError::Timeout(d) if d == Duration::from_millis(50)));
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[tokio::test]
async fn exchange_reply_timeout_applies_by_default() {
    let config = SimplifiedConfig::new("memory").req(ServiceOptions {
        reply_timeout: Some(40),
        ..ServiceOptions::new("slow")
    });
    let (rpc, _) = memory_rpc(config).await;

    let err = rpc
        .request::<_, Value>("v1.slow.work", &json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, RabRpcError::Timeout(d) if d == Duration::from_millis(40)));
}

#[tokio::test]
async fn reply_that_does_not_fit_the_expected_type_is_a_serialization_error() {
    let (rpc, _) = memory_rpc(SimplifiedConfig::new("memory").res("math")).await;
    rpc.respond("v1.math.add", |nums: Vec<i64>, _: Actions, _: String| async move {
        Ok(nums.iter().sum::<i64>())
    })
    .unwrap();

    let sum: i64 = rpc.request("v1.math.add", &[1, 2, 3]).await.unwrap();
    assert_eq!(sum, 6);

    let err = rpc
        .request::<_, String>("v1.math.add", &[1])
        .await
        .unwrap_err();
    assert!(matches!(err, RabRpcError::Serialization(_)));
}

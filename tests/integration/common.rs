use rabrpc::{MemoryBroker, RabRpc, SimplifiedConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A facade over a fresh memory broker, configured with `config`.
pub async fn memory_rpc(config: SimplifiedConfig) -> (RabRpc, MemoryBroker) {
    let broker = MemoryBroker::new();
    let rpc = RabRpc::new(Arc::new(broker.clone()));
    rpc.configure(&config).await.expect("memory broker accepts config");
    (rpc, broker)
}

/// Poll `check` until it holds or a second has passed.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

//! Pluggable queue transport (§4.A).
//!
//! Two variants implement [`Transport`]: [`memory::MemoryTransport`] (an
//! in-process map of channels) and [`broker::BrokerTransport`] (Redis
//! pub/sub). [`select`] picks one based on configuration — a small factory
//! in place of the original's class-definition-time dispatch trick (§9).

mod broker;
mod memory;

pub use broker::BrokerTransport;
pub use memory::MemoryTransport;

use async_trait::async_trait;
use tunnelgate_shared::{Envelope, Result};

/// Named message queues with create/get/enqueue/dequeue/delete and an
/// existence probe.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a queue. Idempotent per process for the in-memory
    /// variant; for the broker, establishes a subscription.
    async fn create(&self, name: &str) -> Result<()>;

    /// Establish a queue only if it doesn't already exist. Returns whether
    /// this call is the one that created it — the atomic compare-and-swap
    /// §5 requires for registry mutations, where `create` alone can't tell
    /// two racing callers apart because it's idempotent by design.
    async fn create_if_absent(&self, name: &str) -> Result<bool>;

    /// Attach to an existing queue. Fails with `NotFound` if no such queue
    /// exists — used by the sender side to refuse traffic to dead tunnels.
    async fn open(&self, name: &str) -> Result<()>;

    /// Non-blocking publish, serialized as JSON.
    async fn enqueue(&self, name: &str, envelope: &Envelope) -> Result<()>;

    /// Block until the next envelope. FIFO per queue, cancellable: a
    /// `delete` racing a pending `dequeue` resolves it with `Closed`.
    async fn dequeue(&self, name: &str) -> Result<Envelope>;

    /// Boolean liveness probe.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Remove the queue. Any pending `dequeue` is cancelled with `Closed`.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Select a transport implementation: broker iff a broker URL is
/// configured, else in-memory (§4.A tie-break).
pub async fn select(redis_url: Option<&str>) -> anyhow::Result<Box<dyn Transport>> {
    match redis_url {
        Some(url) => Ok(Box::new(BrokerTransport::connect(url).await?)),
        None => Ok(Box::new(MemoryTransport::new())),
    }
}

//! Tunnel registry (§4.B).
//!
//! The inbox queue's existence *is* the registry — claim/release simply
//! create/delete that queue through the transport, collapsing two sources
//! of truth into one and making liveness observable uniformly across
//! transports.

use std::sync::Arc;

use rand::RngCore;
use tunnelgate_shared::Result;

use crate::transport::Transport;

pub struct TunnelRegistry {
    transport: Arc<dyn Transport>,
}

impl TunnelRegistry {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Returns `proposed` if free, else a freshly generated 32-hex label.
    ///
    /// Freeness is decided by `Transport::create_if_absent`, not a separate
    /// `exists` probe followed by `create` — two racing `claim(Some(s))`
    /// calls that both observed `exists(s) == false` before either created
    /// it would otherwise both win, handing the same subdomain to two
    /// control sessions (invariant 1). `create_if_absent` reports which
    /// single caller actually won the insert, so a loser regenerates.
    pub async fn claim(&self, proposed: Option<String>) -> Result<String> {
        let mut candidate = proposed.unwrap_or_else(generate_subdomain);
        loop {
            if self.transport.create_if_absent(&candidate).await? {
                return Ok(candidate);
            }
            candidate = generate_subdomain();
        }
    }

    /// Delete the tunnel's inbox queue.
    pub async fn release(&self, subdomain: &str) -> Result<()> {
        self.transport.delete(subdomain).await
    }
}

/// A fresh, random 32-hex subdomain label.
fn generate_subdomain() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn claim_returns_proposed_when_free() {
        let registry = TunnelRegistry::new(Arc::new(MemoryTransport::new()));
        let subdomain = registry.claim(Some("demo".into())).await.unwrap();
        assert_eq!(subdomain, "demo");
    }

    #[tokio::test]
    async fn claim_generates_fresh_label_on_collision() {
        let registry = TunnelRegistry::new(Arc::new(MemoryTransport::new()));
        let a = registry.claim(Some("demo".into())).await.unwrap();
        let b = registry.claim(Some("demo".into())).await.unwrap();
        assert_eq!(a, "demo");
        assert_ne!(b, "demo");
        assert_eq!(b.len(), 32);
        assert!(b.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn claim_generates_label_when_none_proposed() {
        let registry = TunnelRegistry::new(Arc::new(MemoryTransport::new()));
        let subdomain = registry.claim(None).await.unwrap();
        assert_eq!(subdomain.len(), 32);
    }

    #[tokio::test]
    async fn concurrent_claims_of_the_same_subdomain_have_at_most_one_winner() {
        let registry = Arc::new(TunnelRegistry::new(Arc::new(MemoryTransport::new())));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(
                async move { registry.claim(Some("demo".into())).await.unwrap() },
            ));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(results.iter().filter(|s| s.as_str() == "demo").count(), 1);
    }

    #[tokio::test]
    async fn release_frees_the_subdomain_for_reclaim() {
        let registry = TunnelRegistry::new(Arc::new(MemoryTransport::new()));
        registry.claim(Some("demo".into())).await.unwrap();
        registry.release("demo").await.unwrap();
        let again = registry.claim(Some("demo".into())).await.unwrap();
        assert_eq!(again, "demo");
    }
}

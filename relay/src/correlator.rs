//! Request correlator (§4.C).
//!
//! Fans an ingress call through the tunnel's inbox and rendezvouses on a
//! freshly created, per-exchange reply queue.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tunnelgate_shared::{Envelope, Error, Result};

use crate::transport::Transport;

pub struct RequestCorrelator {
    transport: Arc<dyn Transport>,
}

impl RequestCorrelator {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Generate a fresh `id`, enqueue `request_envelope` (with that id) on
    /// the tunnel's inbox, and await the matching reply. The reply queue
    /// is guaranteed to be deleted on every exit path, including if this
    /// future is dropped before completion (see [`ReplyQueueGuard`]).
    pub async fn exchange(&self, subdomain: &str, request_envelope: Envelope) -> Result<Envelope> {
        let id = request_envelope.id.clone();
        self.exchange_with_id(subdomain, request_envelope, &id).await
    }

    /// As [`Self::exchange`], bounded by an optional per-exchange deadline
    /// (§9 Open Question). A wedged tunnel otherwise blocks the caller
    /// indefinitely until its socket is torn down.
    pub async fn exchange_with_timeout(
        &self,
        subdomain: &str,
        request_envelope: Envelope,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        let fut = self.exchange(subdomain, request_envelope);
        match timeout {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| Error::NotFound(subdomain.to_string()))?,
            None => fut.await,
        }
    }

    async fn exchange_with_id(
        &self,
        subdomain: &str,
        mut request_envelope: Envelope,
        id: &str,
    ) -> Result<Envelope> {
        let reply_name = format!("{subdomain}_{id}");

        self.transport.create(&reply_name).await?;
        let guard = ReplyQueueGuard::new(self.transport.clone(), reply_name.clone());

        if let Err(e) = self.transport.open(subdomain).await {
            return Err(e);
        }

        request_envelope.id = id.to_string();
        self.transport.enqueue(subdomain, &request_envelope).await?;

        debug!(subdomain, id, "exchange: awaiting reply");
        let result = self.transport.dequeue(&reply_name).await;
        drop(guard);
        result.map_err(Error::into_not_found)
    }
}

/// Guarantees the reply queue is deleted exactly once, even if the
/// `Correlator.exchange` future is cancelled mid-`.await` — a cancelled
/// future skips the rest of its body, so ordinary "delete after await"
/// code never runs. `Drop` can't run async code, so it spawns the
/// deletion as a detached task; deletion is idempotent, so this never
/// double-frees even when the normal path also deletes on completion.
struct ReplyQueueGuard {
    transport: Arc<dyn Transport>,
    name: String,
}

impl ReplyQueueGuard {
    fn new(transport: Arc<dyn Transport>, name: String) -> Self {
        Self { transport, name }
    }
}

impl Drop for ReplyQueueGuard {
    fn drop(&mut self) {
        let transport = self.transport.clone();
        let name = std::mem::take(&mut self.name);
        tokio::spawn(async move {
            let _ = transport.delete(&name).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TunnelRegistry;
    use crate::transport::MemoryTransport;
    use tunnelgate_shared::{HttpRequestPayload, Kind};

    fn request_envelope() -> Envelope {
        Envelope::new(
            Kind::Request,
            "placeholder",
            HttpRequestPayload {
                method: "GET".into(),
                path: "/".into(),
                headers: vec![],
                body: String::new(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn exchange_returns_not_found_when_no_tunnel() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let correlator = RequestCorrelator::new(transport.clone());

        let result = correlator.exchange("nobody", request_envelope()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn reply_queue_is_absent_before_and_after_exchange() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let registry = TunnelRegistry::new(transport.clone());
        let correlator = RequestCorrelator::new(transport.clone());

        let subdomain = registry.claim(Some("demo".into())).await.unwrap();

        let echo_transport = transport.clone();
        let echo_subdomain = subdomain.clone();
        tokio::spawn(async move {
            let request = echo_transport.dequeue(&echo_subdomain).await.unwrap();
            let reply_name = format!("{echo_subdomain}_{}", request.id);
            let payload: HttpRequestPayload = request.decode().unwrap();
            let response = Envelope::new(
                Kind::Response,
                request.id,
                tunnelgate_shared::HttpResponsePayload {
                    status: 200,
                    headers: vec![],
                    body: tunnelgate_shared::encode_body(payload.path.as_bytes()),
                },
            )
            .unwrap();
            echo_transport.enqueue(&reply_name, &response).await.unwrap();
        });

        let response = correlator
            .exchange(&subdomain, request_envelope())
            .await
            .unwrap();
        let payload: tunnelgate_shared::HttpResponsePayload = response.decode().unwrap();
        assert_eq!(payload.status, 200);

        // Give the guard's spawned deletion a chance to run.
        tokio::task::yield_now().await;
        assert!(!transport
            .exists(&format!("{subdomain}_placeholder"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cancellation_still_deletes_the_reply_queue() {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        let registry = TunnelRegistry::new(transport.clone());
        let correlator = Arc::new(RequestCorrelator::new(transport.clone()));

        let subdomain = registry.claim(Some("demo".into())).await.unwrap();

        let c = correlator.clone();
        let sub = subdomain.clone();
        let handle = tokio::spawn(async move { c.exchange(&sub, request_envelope()).await });

        tokio::task::yield_now().await;
        handle.abort();
        let _ = handle.await;

        // Allow the detached cleanup task to run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!transport
            .exists(&format!("{subdomain}_placeholder"))
            .await
            .unwrap());
    }
}

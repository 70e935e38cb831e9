//! In-memory transport: a process-global map from queue name to an
//! unbounded FIFO channel (§4.A).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tunnelgate_shared::{Envelope, Error, Result};

use super::Transport;

struct Queue {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Envelope>>>,
    cancel: CancellationToken,
}

/// Process-global in-memory queue registry. `exists` tests key presence;
/// deletion removes the map entry and wakes any blocked `dequeue`.
pub struct MemoryTransport {
    queues: DashMap<String, Queue>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn create(&self, name: &str) -> Result<()> {
        self.create_if_absent(name).await?;
        Ok(())
    }

    async fn create_if_absent(&self, name: &str) -> Result<bool> {
        match self.queues.entry(name.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                let (sender, receiver) = mpsc::unbounded_channel();
                v.insert(Queue {
                    sender,
                    receiver: Arc::new(Mutex::new(receiver)),
                    cancel: CancellationToken::new(),
                });
                Ok(true)
            }
        }
    }

    async fn open(&self, name: &str) -> Result<()> {
        if self.queues.contains_key(name) {
            Ok(())
        } else {
            Err(Error::NotFound(name.to_string()))
        }
    }

    async fn enqueue(&self, name: &str, envelope: &Envelope) -> Result<()> {
        let queue = self
            .queues
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        queue
            .sender
            .send(envelope.clone())
            .map_err(|_| Error::Closed(name.to_string()))
    }

    async fn dequeue(&self, name: &str) -> Result<Envelope> {
        let (receiver, cancel) = {
            let queue = self
                .queues
                .get(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            (queue.receiver.clone(), queue.cancel.clone())
        };

        let mut receiver = receiver.lock().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Closed(name.to_string())),
            item = receiver.recv() => item.ok_or_else(|| Error::Closed(name.to_string())),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.queues.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if let Some((_, queue)) = self.queues.remove(name) {
            queue.cancel.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelgate_shared::Kind;

    fn envelope(id: &str) -> Envelope {
        Envelope::new(Kind::Ack, id, tunnelgate_shared::WsAckPayload::default()).unwrap()
    }

    #[tokio::test]
    async fn fifo_order_preserved() {
        let t = MemoryTransport::new();
        t.create("q").await.unwrap();
        for i in 0..5 {
            t.enqueue("q", &envelope(&i.to_string())).await.unwrap();
        }
        for i in 0..5 {
            let got = t.dequeue("q").await.unwrap();
            assert_eq!(got.id, i.to_string());
        }
    }

    #[tokio::test]
    async fn delete_wakes_pending_dequeue_with_closed() {
        let t = Arc::new(MemoryTransport::new());
        t.create("q").await.unwrap();

        let t2 = t.clone();
        let waiter = tokio::spawn(async move { t2.dequeue("q").await });

        tokio::task::yield_now().await;
        t.delete("q").await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("dequeue should resolve promptly after delete")
            .unwrap();
        assert!(matches!(result, Err(Error::Closed(_))));
    }

    #[tokio::test]
    async fn open_fails_not_found_when_absent() {
        let t = MemoryTransport::new();
        assert!(matches!(t.open("missing").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn exists_reflects_create_and_delete() {
        let t = MemoryTransport::new();
        assert!(!t.exists("q").await.unwrap());
        t.create("q").await.unwrap();
        assert!(t.exists("q").await.unwrap());
        t.delete("q").await.unwrap();
        assert!(!t.exists("q").await.unwrap());
    }

    #[tokio::test]
    async fn create_if_absent_reports_only_one_winner() {
        let t = MemoryTransport::new();
        assert!(t.create_if_absent("q").await.unwrap());
        assert!(!t.create_if_absent("q").await.unwrap());
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let t = MemoryTransport::new();
        t.create("q").await.unwrap();
        t.enqueue("q", &envelope("1")).await.unwrap();
        t.create("q").await.unwrap();
        let got = t.dequeue("q").await.unwrap();
        assert_eq!(got.id, "1");
    }
}

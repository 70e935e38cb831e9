//! Broker (Redis pub/sub) transport (§4.A).
//!
//! Each queue name maps to a pub/sub channel. `create` opens a dedicated
//! subscriber connection; `enqueue` publishes JSON over a shared
//! multiplexed connection; `exists` queries `PUBSUB NUMSUB` for active
//! subscribers; `delete` drops the subscriber connection, which
//! unsubscribes implicitly.
//!
//! Pub/sub has no backlog, so `create` must happen-before any `enqueue`
//! for that name — the correlator enforces this ordering (§4.A, §9).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tunnelgate_shared::{Envelope, Error, Result};

use super::Transport;

struct Subscription {
    pubsub: Arc<Mutex<PubSub>>,
    cancel: CancellationToken,
}

pub struct BrokerTransport {
    client: redis::Client,
    conn: ConnectionManager,
    subs: DashMap<String, Subscription>,
}

impl BrokerTransport {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            subs: DashMap::new(),
        })
    }

    fn fault(context: &str, err: impl std::fmt::Display) -> Error {
        Error::TransportFault(format!("{context}: {err}"))
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    async fn create(&self, name: &str) -> Result<()> {
        self.create_if_absent(name).await?;
        Ok(())
    }

    /// Subscribes eagerly, then inserts atomically via `DashMap::entry` so
    /// two racing callers can't both believe they created `name` — a caller
    /// that loses the race drops its freshly opened subscription, which
    /// unsubscribes by closing the connection.
    async fn create_if_absent(&self, name: &str) -> Result<bool> {
        if self.subs.contains_key(name) {
            return Ok(false);
        }

        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| Self::fault("opening subscriber connection", e))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(name)
            .await
            .map_err(|e| Self::fault("subscribing", e))?;

        let subscription = Subscription {
            pubsub: Arc::new(Mutex::new(pubsub)),
            cancel: CancellationToken::new(),
        };

        match self.subs.entry(name.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(v) => {
                v.insert(subscription);
                Ok(true)
            }
        }
    }

    async fn open(&self, name: &str) -> Result<()> {
        if self.exists(name).await? {
            Ok(())
        } else {
            Err(Error::NotFound(name.to_string()))
        }
    }

    async fn enqueue(&self, name: &str, envelope: &Envelope) -> Result<()> {
        let json = envelope.to_json()?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(name, json)
            .await
            .map_err(|e| Self::fault("publishing", e))?;
        Ok(())
    }

    async fn dequeue(&self, name: &str) -> Result<Envelope> {
        let (pubsub, cancel) = {
            let sub = self
                .subs
                .get(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            (sub.pubsub.clone(), sub.cancel.clone())
        };

        let mut guard = pubsub.lock().await;
        let mut stream = guard.on_message();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Closed(name.to_string())),
            msg = stream.next() => {
                let msg = msg.ok_or_else(|| Error::Closed(name.to_string()))?;
                let payload: String = msg
                    .get_payload()
                    .map_err(|e| Self::fault("decoding message", e))?;
                Envelope::from_json(&payload)
            }
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Vec<redis::Value> = redis::cmd("PUBSUB")
            .arg("NUMSUB")
            .arg(name)
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::fault("querying PUBSUB NUMSUB", e))?;
        // Reply shape: [channel, count]. A bare integer reply is never
        // returned for NUMSUB, so only the pair form is handled.
        let count = match reply.get(1) {
            Some(redis::Value::Int(n)) => *n,
            _ => 0,
        };
        Ok(count > 0)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if let Some((_, sub)) = self.subs.remove(name) {
            sub.cancel.cancel();
        }
        Ok(())
    }
}

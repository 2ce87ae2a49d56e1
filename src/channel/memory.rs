//! In-process connector used to run sessions without a network service.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use anyhow::{anyhow, Result};
use futures::{
    channel::mpsc as fmpsc,
    future::{self, BoxFuture},
    FutureExt, SinkExt, StreamExt,
};
use tokio::sync::mpsc;

use super::{Connection, Connector};

/// Service side of one in-memory connection.
pub struct MemoryPeer {
    pub url: String,
    from_client: fmpsc::UnboundedReceiver<String>,
    to_client: fmpsc::UnboundedSender<Result<String, String>>,
}

impl MemoryPeer {
    /// Next raw message the client sent, or `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Next message parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let raw = self.recv().await?;
        serde_json::from_str(&raw).ok()
    }

    /// Message already buffered, if any, without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.from_client.try_next().ok().flatten()
    }

    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        self.to_client
            .unbounded_send(Ok(text.into()))
            .map_err(|_| anyhow!("client side of the connection is gone"))
    }

    pub fn send_json(&self, value: &serde_json::Value) -> Result<()> {
        self.send(value.to_string())
    }

    /// Fail the connection with a transport error.
    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.to_client.unbounded_send(Err(reason.into()));
    }

    /// Close the connection cleanly from the service side.
    pub fn close(self) {
        drop(self);
    }
}

/// Connector that hands the service end of each connection to a test or
/// embedding through [`MemoryPeers`].
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
    refuse_message: Mutex<String>,
}

pub struct MemoryPeers {
    rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryPeers {
    pub async fn next_peer(&mut self) -> Option<MemoryPeer> {
        self.rx.recv().await
    }
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryPeers) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: tx,
                failures_remaining: AtomicUsize::new(0),
                attempts: AtomicUsize::new(0),
                refuse_message: Mutex::new("connection refused".into()),
            },
            MemoryPeers { rx },
        )
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize, reason: impl Into<String>) {
        self.failures_remaining.store(count, Ordering::SeqCst);
        if let Ok(mut guard) = self.refuse_message.lock() {
            *guard = reason.into();
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.take_failure() {
            let reason = self
                .refuse_message
                .lock()
                .map(|guard| guard.clone())
                .unwrap_or_else(|_| "connection refused".into());
            return future::ready(Err(anyhow!(reason))).boxed();
        }

        let (client_tx, from_client) = fmpsc::unbounded::<String>();
        let (to_client, client_rx) = fmpsc::unbounded::<Result<String, String>>();
        let peer = MemoryPeer {
            url: url.to_string(),
            from_client,
            to_client,
        };

        let result = if self.peers.send(peer).is_err() {
            Err(anyhow!("no service is listening on {url}"))
        } else {
            Ok(Connection {
                sink: Box::pin(client_tx.sink_map_err(|err| anyhow!(err))),
                stream: client_rx.map(|item| item.map_err(|err| anyhow!(err))).boxed(),
            })
        };
        future::ready(result).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_flow_both_ways() -> Result<()> {
        let (connector, mut peers) = MemoryConnector::new();
        let mut conn = connector.connect("mem://service").await?;
        let mut peer = peers.next_peer().await.expect("peer should be handed over");
        assert_eq!(peer.url, "mem://service");

        conn.sink.send("hello".to_string()).await?;
        assert_eq!(peer.recv().await.as_deref(), Some("hello"));

        peer.send("world")?;
        assert_eq!(conn.stream.next().await.transpose()?.as_deref(), Some("world"));

        peer.close();
        assert!(conn.stream.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn refused_attempts_are_counted() {
        let (connector, _peers) = MemoryConnector::new();
        connector.refuse_next(1, "nope");
        let err = connector.connect("mem://service").await.err().map(|e| e.to_string());
        assert_eq!(err.as_deref(), Some("nope"));
        assert!(connector.connect("mem://service").await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn failure_surfaces_as_stream_error() {
        let (connector, mut peers) = MemoryConnector::new();
        let mut conn = connector.connect("mem://service").await.unwrap();
        let peer = peers.next_peer().await.unwrap();
        peer.fail("reset by peer");
        let item = conn.stream.next().await.expect("error item");
        assert!(item.is_err());
    }
}

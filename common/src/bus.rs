// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Message bus abstraction over `async-nats`, mirroring the `Runtime` trait
//! pattern used for swappable backends in the action controller: a real
//! NATS-backed implementation for production and an in-memory fake for tests.

use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// A message received from a subscription, carrying the reply subject the
/// bus protocol uses for request/reply (§2, §4.7).
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

/// A live subscription handle; `next` resolves to `None` once the bus drops it.
#[async_trait]
pub trait Subscription: Send {
    async fn next(&mut self) -> Option<BusMessage>;
}

/// Publish/request/subscribe surface every component depends on instead of
/// talking to `async-nats` directly.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Request/reply with `NoResponders`/`Timeout` surfaced distinctly (§2).
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// `queue_group` of `None` subscribes every node (fan-out); `Some(g)`
    /// load-balances across members of `g` (single-winner dispatch).
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Box<dyn Subscription>, TransportError>;
}

/// Production implementation backed by a live `async-nats` connection.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let fut = self.client.request(subject.to_string(), payload.into());
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(message)) => Ok(message.payload.to_vec()),
            Ok(Err(e)) => {
                let msg = e.to_string();
                if msg.to_lowercase().contains("no responders") {
                    Err(TransportError::NoResponders(subject.to_string()))
                } else {
                    Err(TransportError::PublishFailed(msg))
                }
            }
            Err(_) => Err(TransportError::Timeout(subject.to_string())),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let inner = match queue_group {
            Some(group) => self
                .client
                .queue_subscribe(subject.to_string(), group.to_string())
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?,
            None => self
                .client
                .subscribe(subject.to_string())
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?,
        };
        Ok(Box::new(NatsSubscription { inner }))
    }
}

struct NatsSubscription {
    inner: async_nats::Subscriber,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        use futures_util::StreamExt;
        let msg = self.inner.next().await?;
        Some(BusMessage {
            subject: msg.subject.to_string(),
            reply_to: msg.reply.map(|s| s.to_string()),
            payload: msg.payload.to_vec(),
        })
    }
}

/// In-process fake used by component unit tests; delivers every publish to
/// every live subscriber on the same subject regardless of `queue_group`
/// (good enough for single-subscriber-per-subject test scenarios).
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let subs = self.subscribers.lock().unwrap();
        if let Some(senders) = subs.get(subject) {
            for sender in senders {
                let _ = sender.send(BusMessage {
                    subject: subject.to_string(),
                    reply_to: None,
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let reply_subject = format!("_INBOX.{subject}.{}", uuid::Uuid::new_v4());
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .entry(reply_subject.clone())
            .or_default()
            .push(tx);

        let has_responders = {
            let subs = self.subscribers.lock().unwrap();
            subs.get(subject).map(|v| !v.is_empty()).unwrap_or(false)
        };
        if !has_responders {
            return Err(TransportError::NoResponders(subject.to_string()));
        }

        {
            let subs = self.subscribers.lock().unwrap();
            for sender in subs.get(subject).into_iter().flatten() {
                let _ = sender.send(BusMessage {
                    subject: subject.to_string(),
                    reply_to: Some(reply_subject.clone()),
                    payload: payload.clone(),
                });
            }
        }

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(msg)) => Ok(msg.payload),
            Ok(None) | Err(_) => Err(TransportError::Timeout(subject.to_string())),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        _queue_group: Option<&str>,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        Ok(Box::new(InMemorySubscription { rx }))
    }
}

struct InMemorySubscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Reply to `message` on its `reply_to` subject, if one was set (a message
/// without a reply subject is fire-and-forget and silently ignored).
pub async fn reply(bus: &dyn Bus, message: &BusMessage, payload: Vec<u8>) -> Result<(), TransportError> {
    match &message.reply_to {
        Some(subject) => bus.publish(subject, payload).await,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_without_responder_returns_no_responders() {
        let bus = InMemoryBus::new();
        let result = bus
            .request("hive.node.vms", b"{}".to_vec(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::NoResponders(_))));
    }

    #[tokio::test]
    async fn publish_then_subscribe_round_trips_payload() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("hive.nodes.discover", None).await.unwrap();
        bus.publish("hive.nodes.discover", b"ping".to_vec())
            .await
            .unwrap();
        let msg = sub.next().await.unwrap();
        assert_eq!(msg.payload, b"ping");
    }

    #[tokio::test]
    async fn request_reply_round_trips_through_subscriber() {
        let bus = std::sync::Arc::new(InMemoryBus::new());
        let mut sub = bus.subscribe("hive.node.status", None).await.unwrap();

        let responder_bus = bus.clone();
        tokio::spawn(async move {
            if let Some(msg) = sub.next().await {
                reply(&*responder_bus, &msg, b"ok".to_vec()).await.unwrap();
            }
        });

        let response = bus
            .request("hive.node.status", b"{}".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, b"ok");
    }
}

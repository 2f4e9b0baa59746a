// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process [`MessageBus`] with broker-like retained semantics.
//!
//! Retained publishes are stored per topic and replayed to every new
//! subscription with the retained flag set; live deliveries to existing
//! subscribers carry the flag cleared, as an MQTT 3.1.1 broker does.
//! Responders can be attached to topic filters to script device replies.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use super::{ListenerSet, Message, MessageBus, Subscription, topic_matches};
use crate::error::ProtocolError;

type ReplyFn = dyn Fn(&Message) -> Vec<Message> + Send + Sync;

struct Responder {
    filter: String,
    delay: Duration,
    reply: Arc<ReplyFn>,
}

/// A message recorded by [`MemoryBus::published`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Payload as text.
    pub payload: String,
    /// Retain flag of the publish.
    pub retain: bool,
}

/// An in-memory bus.
///
/// Cheaply cloneable; clones share the same state.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tasmota_fleet::bus::{MemoryBus, Message, MessageBus};
///
/// # async fn example() -> tasmota_fleet::Result<()> {
/// let bus = MemoryBus::new();
/// bus.respond("cmnd/+/Power", Duration::ZERO, |msg| {
///     let device = msg.topic.split('/').nth(1).unwrap_or_default();
///     vec![Message::new(format!("stat/{device}/RESULT"), r#"{"POWER":"ON"}"#, false)]
/// });
///
/// let mut acks = bus.subscribe(&["stat/+/RESULT".to_string()]).await?;
/// bus.publish("cmnd/plug/Power", b"ON", false).await?;
/// assert_eq!(acks.recv().await.unwrap().topic, "stat/plug/RESULT");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<MemoryBusInner>,
}

#[derive(Default)]
struct MemoryBusInner {
    listeners: ListenerSet,
    retained: Mutex<BTreeMap<String, Message>>,
    responders: Mutex<Vec<Responder>>,
    published: Mutex<Vec<PublishedMessage>>,
    disconnected: AtomicBool,
}

impl MemoryBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a retained message without notifying current subscribers.
    pub fn seed_retained(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        let message = Message::new(topic, payload, true);
        self.inner
            .retained
            .lock()
            .insert(message.topic.clone(), message);
    }

    /// Delivers a message as if another client had published it.
    ///
    /// Retained messages are also stored for future subscribers.
    pub fn inject(&self, message: Message) {
        if message.retained {
            self.store_retained(&message);
        }
        self.inner.listeners.route(&Message {
            retained: false,
            ..message
        });
    }

    /// Attaches a scripted responder.
    ///
    /// Every publish matching `filter` is passed to `reply`; the returned
    /// messages are delivered after `delay`. A zero delay delivers them
    /// before `publish` returns.
    pub fn respond<F>(&self, filter: impl Into<String>, delay: Duration, reply: F)
    where
        F: Fn(&Message) -> Vec<Message> + Send + Sync + 'static,
    {
        self.inner.responders.lock().push(Responder {
            filter: filter.into(),
            delay,
            reply: Arc::new(reply),
        });
    }

    /// Simulates a lost connection; every later bus call fails.
    pub fn disconnect(&self) {
        self.inner.disconnected.store(true, Ordering::Release);
        self.inner.listeners.close_all();
    }

    /// Returns every message published through this bus, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().clone()
    }

    /// Returns the topics currently holding a retained message.
    #[must_use]
    pub fn retained_topics(&self) -> Vec<String> {
        self.inner.retained.lock().keys().cloned().collect()
    }

    /// Returns the number of open subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.len()
    }

    fn store_retained(&self, message: &Message) {
        let mut retained = self.inner.retained.lock();
        if message.payload.is_empty() {
            retained.remove(&message.topic);
        } else {
            retained.insert(message.topic.clone(), message.clone());
        }
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.inner.disconnected.load(Ordering::Acquire) {
            Err(ProtocolError::ConnectionFailed(
                "memory bus disconnected".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn run_responders(&self, message: &Message) {
        let matching: Vec<(Duration, Arc<ReplyFn>)> = self
            .inner
            .responders
            .lock()
            .iter()
            .filter(|r| topic_matches(&r.filter, &message.topic))
            .map(|r| (r.delay, Arc::clone(&r.reply)))
            .collect();

        for (delay, reply) in matching {
            let replies = reply(message);
            if delay.is_zero() {
                for reply in replies {
                    self.inject(reply);
                }
            } else {
                let bus = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for reply in replies {
                        bus.inject(reply.received_at(Utc::now()));
                    }
                });
            }
        }
    }
}

impl MessageBus for MemoryBus {
    async fn subscribe(&self, patterns: &[String]) -> Result<Subscription, ProtocolError> {
        self.ensure_connected()?;

        let subscription = self.inner.listeners.register(patterns);
        let replay: Vec<Message> = self
            .inner
            .retained
            .lock()
            .values()
            .filter(|m| patterns.iter().any(|p| topic_matches(p, &m.topic)))
            .cloned()
            .collect();

        for message in replay {
            self.inner.listeners.deliver_to(
                subscription.id(),
                Message {
                    retained: true,
                    received_at: Utc::now(),
                    ..message
                },
            );
        }
        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), ProtocolError> {
        self.inner.listeners.remove(subscription.id());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), ProtocolError> {
        self.ensure_connected()?;

        self.inner.published.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            retain,
        });

        let message = Message::new(topic, payload, retain);
        self.inject(message.clone());
        self.run_responders(&message);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("listeners", &self.inner.listeners)
            .field("retained", &self.inner.retained.lock().len())
            .finish_non_exhaustive()
    }
}

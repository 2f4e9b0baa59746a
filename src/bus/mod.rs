// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Publish/subscribe bus abstraction.
//!
//! The engine never talks to an MQTT client directly. Every component takes a
//! reference to a single, already connected [`MessageBus`] at construction
//! time and uses it to subscribe to topic filters and to publish commands.
//!
//! Two implementations ship with the crate:
//!
//! - [`MqttBus`]: a persistent rumqttc connection (feature `mqtt`)
//! - [`MemoryBus`]: an in-process bus with a retained store, used for tests
//!   and offline dry runs
//!
//! # Examples
//!
//! ```
//! use tasmota_fleet::bus::{MemoryBus, MessageBus};
//!
//! # async fn example() -> tasmota_fleet::Result<()> {
//! let bus = MemoryBus::new();
//! bus.publish("tele/plug/LWT", b"Online", true).await?;
//!
//! let mut sub = bus.subscribe(&["tele/+/LWT".to_string()]).await?;
//! let msg = sub.recv().await.unwrap();
//! assert!(msg.retained);
//! assert_eq!(msg.payload_lossy(), "Online");
//! # Ok(())
//! # }
//! ```

mod memory;
#[cfg(feature = "mqtt")]
mod mqtt_bus;

pub use memory::{MemoryBus, PublishedMessage};
#[cfg(feature = "mqtt")]
pub use mqtt_bus::{MqttBus, MqttBusBuilder, MqttBusConfig};

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{ParseError, ProtocolError};

/// A message delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Full topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Whether the broker delivered this as a retained message.
    pub retained: bool,
    /// When the message was received locally.
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Creates a message stamped with the current time.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained,
            received_at: Utc::now(),
        }
    }

    /// Replaces the receive timestamp.
    #[must_use]
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Returns the payload as UTF-8.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::NotUtf8`] if the payload is binary.
    pub fn payload_str(&self) -> Result<&str, ParseError> {
        std::str::from_utf8(&self.payload).map_err(|_| ParseError::NotUtf8)
    }

    /// Returns the payload as text, replacing invalid UTF-8 sequences.
    #[must_use]
    pub fn payload_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A live subscription returned by [`MessageBus::subscribe`].
///
/// Messages matching any of the subscription's filters are queued until
/// [`recv`](Self::recv) is called. Dropping the subscription stops delivery;
/// pass it to [`MessageBus::unsubscribe`] to also release broker filters.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    patterns: Vec<String>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    /// Returns the listener identifier.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the topic filters of this subscription.
    #[must_use]
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Receives the next message, or `None` once the bus has shut down.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

/// The publish/subscribe operations the engine needs from a bus client.
///
/// Implementations own the connection exclusively. Reconnection is not part
/// of this contract: a failed operation is reported as a [`ProtocolError`]
/// and treated as fatal by callers.
#[allow(async_fn_in_trait)]
pub trait MessageBus {
    /// Subscribes to a set of topic filters (`+` and `#` wildcards allowed).
    ///
    /// Retained messages matching the filters are redelivered by the broker
    /// with their retained flag set.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the subscription cannot be issued.
    async fn subscribe(&self, patterns: &[String]) -> Result<Subscription, ProtocolError>;

    /// Ends a subscription and releases its filters.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the broker rejects the request.
    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), ProtocolError>;

    /// Publishes a payload.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the message cannot be handed to the broker.
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool)
    -> Result<(), ProtocolError>;
}

/// Returns true if `topic` matches the MQTT topic `filter`.
///
/// `+` matches exactly one level and `#` matches the remaining levels,
/// including none. Wildcards in the first level never match topics that
/// start with `$`.
///
/// # Examples
///
/// ```
/// use tasmota_fleet::bus::topic_matches;
///
/// assert!(topic_matches("tele/+/LWT", "tele/plug/LWT"));
/// assert!(topic_matches("tasmota/discovery/#", "tasmota/discovery/AABB/config"));
/// assert!(!topic_matches("tele/+/LWT", "tele/plug/STATE"));
/// ```
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Listener {
    id: u64,
    patterns: Vec<String>,
    tx: mpsc::UnboundedSender<Message>,
}

/// Fan-out of incoming messages to active subscriptions.
///
/// Closed listeners are pruned lazily while routing.
#[derive(Default)]
pub(crate) struct ListenerSet {
    next_id: AtomicU64,
    listeners: RwLock<Vec<Listener>>,
}

impl ListenerSet {
    pub(crate) fn register(&self, patterns: &[String]) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.write().push(Listener {
            id,
            patterns: patterns.to_vec(),
            tx,
        });
        tracing::trace!(listener = id, ?patterns, "Registered bus listener");
        Subscription {
            id,
            patterns: patterns.to_vec(),
            rx,
        }
    }

    /// Delivers a message to one listener only, if it is still registered.
    pub(crate) fn deliver_to(&self, id: u64, message: Message) {
        if let Some(listener) = self.listeners.read().iter().find(|l| l.id == id) {
            let _ = listener.tx.send(message);
        }
    }

    pub(crate) fn remove(&self, id: u64) {
        self.listeners.write().retain(|l| l.id != id);
    }

    /// Routes a message to every matching listener and returns how many
    /// received it.
    pub(crate) fn route(&self, message: &Message) -> usize {
        let mut delivered = 0;
        let mut stale = false;
        {
            let listeners = self.listeners.read();
            for listener in listeners.iter() {
                if !listener
                    .patterns
                    .iter()
                    .any(|p| topic_matches(p, &message.topic))
                {
                    continue;
                }
                if listener.tx.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    stale = true;
                }
            }
        }
        if stale {
            self.listeners.write().retain(|l| !l.tx.is_closed());
        }
        delivered
    }

    /// Drops every listener so pending `recv` calls return `None`.
    pub(crate) fn close_all(&self) {
        self.listeners.write().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_level_wildcard() {
        assert!(topic_matches("tele/+/STATE", "tele/plugA/STATE"));
        assert!(!topic_matches("tele/+/STATE", "tele/a/b/STATE"));
        assert!(!topic_matches("tele/+/STATE", "tele/plugA"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("tasmota/discovery/#", "tasmota/discovery/AA/config"));
        assert!(topic_matches("tasmota/discovery/#", "tasmota/discovery"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("tasmota/discovery/#", "tasmota/other/AA"));
    }

    #[test]
    fn exact_match() {
        assert!(topic_matches("stat/plug/RESULT", "stat/plug/RESULT"));
        assert!(!topic_matches("stat/plug/RESULT", "stat/plug/RESULTS"));
    }

    #[test]
    fn system_topics_need_explicit_prefix() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[tokio::test]
    async fn listener_set_routes_by_filter() {
        let set = ListenerSet::default();
        let mut lwt = set.register(&["tele/+/LWT".to_string()]);
        let mut all = set.register(&["#".to_string()]);

        let delivered = set.route(&Message::new("tele/a/STATE", "{}", false));
        assert_eq!(delivered, 1);
        assert_eq!(all.recv().await.unwrap().topic, "tele/a/STATE");

        set.route(&Message::new("tele/a/LWT", "Online", true));
        assert_eq!(lwt.recv().await.unwrap().payload_lossy(), "Online");
    }

    #[test]
    fn listener_set_prunes_dropped_subscriptions() {
        let set = ListenerSet::default();
        let sub = set.register(&["#".to_string()]);
        assert_eq!(set.len(), 1);
        drop(sub);

        assert_eq!(set.route(&Message::new("a/b/c", "x", false)), 0);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn payload_str_rejects_binary() {
        let msg = Message::new("a/b/c", vec![0xff, 0xfe], false);
        assert!(msg.payload_str().is_err());
        assert_eq!(msg.payload_lossy(), "\u{fffd}\u{fffd}");
    }
}

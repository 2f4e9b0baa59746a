// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Time-bounded collection of (retained) messages.
//!
//! Subscribing to a filter makes the broker replay every retained message
//! under it, which turns the broker into a lightweight device registry.
//! [`collect`] subscribes, gathers messages for a grace window, deduplicates
//! them by topic and unsubscribes again.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use tasmota_fleet::bus::MemoryBus;
//! use tasmota_fleet::collector::{CollectOptions, collect};
//!
//! # async fn example() -> tasmota_fleet::Result<()> {
//! let bus = MemoryBus::new();
//! bus.seed_retained("tele/plugA/LWT", "Online");
//!
//! let options = CollectOptions::new().with_grace(Duration::from_millis(200));
//! let collected = collect(&bus, &["tele/+/LWT".to_string()], &options).await?;
//! assert_eq!(collected.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::bus::{Message, MessageBus};
use crate::error::ProtocolError;

/// Which messages to keep based on their retained flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetainedMode {
    /// Keep retained and live messages.
    Yes,
    /// Keep live messages only.
    No,
    /// Keep retained messages only.
    #[default]
    Only,
}

impl RetainedMode {
    /// Returns true if a message with this retained flag is kept.
    #[must_use]
    pub const fn accepts(self, retained: bool) -> bool {
        match self {
            Self::Yes => true,
            Self::No => !retained,
            Self::Only => retained,
        }
    }
}

/// Options for [`collect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectOptions {
    /// Retained flag filter.
    pub retained: RetainedMode,
    /// Upper bound of the receive window.
    pub grace: Duration,
    /// End early once no new topic arrived for this long.
    pub quiet_period: Option<Duration>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            retained: RetainedMode::Only,
            grace: Duration::from_secs(2),
            quiet_period: None,
        }
    }
}

impl CollectOptions {
    /// Creates options with defaults: retained only, 2 second grace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retained filter.
    #[must_use]
    pub fn with_retained(mut self, retained: RetainedMode) -> Self {
        self.retained = retained;
        self
    }

    /// Sets the receive window.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Sets the quiet period after which collection ends early.
    #[must_use]
    pub fn with_quiet_period(mut self, quiet: Duration) -> Self {
        self.quiet_period = Some(quiet);
        self
    }
}

/// Topic prefixes excluded from device construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoiseFilter {
    /// Messages whose topic starts with one of these are noisy.
    pub drop_prefixes: Vec<String>,
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self {
            drop_prefixes: vec!["tele/rtl_433".to_string()],
        }
    }
}

impl NoiseFilter {
    /// A filter that drops nothing.
    #[must_use]
    pub fn none() -> Self {
        Self {
            drop_prefixes: Vec::new(),
        }
    }

    /// Returns true if the topic belongs to a dropped subtree.
    #[must_use]
    pub fn is_noisy(&self, topic: &str) -> bool {
        self.drop_prefixes.iter().any(|p| topic.starts_with(p.as_str()))
    }
}

/// Latest message per topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedMessages {
    messages: BTreeMap<String, Message>,
}

impl CollectedMessages {
    /// Number of distinct topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns the message for a topic.
    #[must_use]
    pub fn get(&self, topic: &str) -> Option<&Message> {
        self.messages.get(topic)
    }

    /// Iterates messages in topic order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    /// Consumes the collection, yielding messages in topic order.
    #[must_use]
    pub fn into_messages(self) -> Vec<Message> {
        self.messages.into_values().collect()
    }

    /// Splits into `(device_eligible, noisy)` messages.
    #[must_use]
    pub fn partition(self, noise: &NoiseFilter) -> (Vec<Message>, Vec<Message>) {
        self.messages
            .into_values()
            .partition(|m| !noise.is_noisy(&m.topic))
    }

    fn insert(&mut self, message: Message) -> bool {
        self.messages.insert(message.topic.clone(), message).is_none()
    }
}

impl FromIterator<Message> for CollectedMessages {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        let mut collected = Self::default();
        for message in iter {
            collected.insert(message);
        }
        collected
    }
}

/// Subscribes to `patterns` and collects messages until the grace window
/// elapses or, with a quiet period, until no new topic arrived for that long.
///
/// A later message on the same topic replaces the earlier one. An empty
/// result is not an error.
///
/// # Errors
///
/// Returns `ProtocolError` if subscribing fails or the bus shuts down while
/// collecting.
pub async fn collect<B: MessageBus>(
    bus: &B,
    patterns: &[String],
    options: &CollectOptions,
) -> Result<CollectedMessages, ProtocolError> {
    let mut subscription = bus.subscribe(patterns).await?;

    let start = Instant::now();
    let deadline = start + options.grace;
    let mut last_new_topic = start;
    let mut collected = CollectedMessages::default();
    let mut discarded = 0usize;

    loop {
        let wake = options
            .quiet_period
            .map_or(deadline, |quiet| deadline.min(last_new_topic + quiet));

        match tokio::time::timeout_at(wake, subscription.recv()).await {
            Ok(Some(message)) => {
                if !options.retained.accepts(message.retained) {
                    discarded += 1;
                    continue;
                }
                if collected.insert(message) {
                    last_new_topic = Instant::now();
                }
            }
            Ok(None) => {
                return Err(ProtocolError::ChannelClosed(
                    "bus closed during collection".to_string(),
                ));
            }
            Err(_) => break,
        }
    }

    bus.unsubscribe(subscription).await?;

    tracing::debug!(
        topics = collected.len(),
        discarded,
        elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        "Collection finished"
    );
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    fn all() -> Vec<String> {
        vec!["#".to_string()]
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bus_returns_empty_after_grace() {
        let bus = MemoryBus::new();
        let start = Instant::now();
        let collected = collect(&bus, &all(), &CollectOptions::new()).await.unwrap();

        assert!(collected.is_empty());
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retained_only_filters_live_messages() {
        let bus = MemoryBus::new();
        bus.seed_retained("tele/a/LWT", "Online");

        let live = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            live.inject(Message::new("tele/b/LWT", "Online", false));
        });

        let collected = collect(&bus, &all(), &CollectOptions::new()).await.unwrap();
        assert_eq!(collected.len(), 1);
        assert!(collected.get("tele/a/LWT").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retained_no_keeps_only_live() {
        let bus = MemoryBus::new();
        bus.seed_retained("tele/a/LWT", "Online");

        let live = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            live.inject(Message::new("tele/b/LWT", "Online", false));
        });

        let options = CollectOptions::new().with_retained(RetainedMode::No);
        let collected = collect(&bus, &all(), &options).await.unwrap();
        assert_eq!(collected.len(), 1);
        assert!(collected.get("tele/b/LWT").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn last_message_per_topic_wins() {
        let bus = MemoryBus::new();
        bus.seed_retained("tele/a/LWT", "Offline");

        let live = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            live.inject(Message::new("tele/a/LWT", "Online", false));
        });

        let options = CollectOptions::new().with_retained(RetainedMode::Yes);
        let collected = collect(&bus, &all(), &options).await.unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected.get("tele/a/LWT").unwrap().payload_lossy(), "Online");
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_ends_early() {
        let bus = MemoryBus::new();
        bus.seed_retained("tele/a/LWT", "Online");

        let start = Instant::now();
        let options = CollectOptions::new()
            .with_grace(Duration::from_secs(10))
            .with_quiet_period(Duration::from_millis(300));
        let collected = collect(&bus, &all(), &options).await.unwrap();

        assert_eq!(collected.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn never_blocks_past_grace_under_steady_traffic() {
        let bus = MemoryBus::new();
        let chatter = bus.clone();
        tokio::spawn(async move {
            for i in 0..1000 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                chatter.inject(Message::new(format!("tele/d{i}/LWT"), "Online", true));
            }
        });

        let start = Instant::now();
        let options = CollectOptions::new()
            .with_retained(RetainedMode::Yes)
            .with_quiet_period(Duration::from_millis(200));
        collect(&bus, &all(), &options).await.unwrap();
        assert!(start.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn subscribe_failure_is_fatal() {
        let bus = MemoryBus::new();
        bus.disconnect();
        assert!(collect(&bus, &all(), &CollectOptions::new()).await.is_err());
    }

    #[test]
    fn partition_splits_noisy_subtree() {
        let collected: CollectedMessages = [
            Message::new("tele/plugA/LWT", "Online", true),
            Message::new("tele/rtl_433/Acurite/1/temperature", "21.5", true),
        ]
        .into_iter()
        .collect();

        let (devices, noisy) = collected.partition(&NoiseFilter::default());
        assert_eq!(devices.len(), 1);
        assert_eq!(noisy.len(), 1);
        assert_eq!(noisy[0].topic, "tele/rtl_433/Acurite/1/temperature");
    }
}

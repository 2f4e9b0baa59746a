// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent MQTT connection implementing [`MessageBus`].
//!
//! A single connection is opened per process and shared by collection and
//! dispatch. Subscriptions are reference counted per filter: re-issuing a
//! SUBSCRIBE for a filter already held makes the broker resend its retained
//! messages, while UNSUBSCRIBE is only sent once the last listener for that
//! filter is gone.
//!
//! # Examples
//!
//! ```no_run
//! use tasmota_fleet::bus::MqttBus;
//!
//! # async fn example() -> tasmota_fleet::Result<()> {
//! let bus = MqttBus::builder()
//!     .host("192.168.1.50")
//!     .port(1883)
//!     .credentials("user", "password")
//!     .build()
//!     .await?;
//!
//! assert!(bus.is_connected());
//! bus.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use tokio::sync::oneshot;

use super::{ListenerSet, Message, MessageBus, Subscription};
use crate::error::ProtocolError;

/// Global counter for generating unique client IDs.
static BUS_CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Connection parameters for an [`MqttBus`].
#[derive(Debug, Clone)]
pub struct MqttBusConfig {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    connection_timeout: Duration,
}

impl Default for MqttBusConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            credentials: None,
            keep_alive: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
        }
    }
}

/// A shared MQTT connection.
///
/// Cheaply cloneable; all clones use the same connection.
#[derive(Clone)]
pub struct MqttBus {
    inner: Arc<MqttBusInner>,
}

struct MqttBusInner {
    client: AsyncClient,
    listeners: ListenerSet,
    /// Broker filters held, with the number of listeners using each.
    filters: Mutex<HashMap<String, usize>>,
    config: MqttBusConfig,
    connected: AtomicBool,
}

impl MqttBus {
    /// Creates a new builder for configuring the connection.
    #[must_use]
    pub fn builder() -> MqttBusBuilder {
        MqttBusBuilder::default()
    }

    /// Returns whether the connection is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Returns the broker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.config.host
    }

    /// Returns the broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.config.port
    }

    /// Closes the connection and ends every open subscription.
    ///
    /// # Errors
    ///
    /// Returns error if the disconnect request cannot be queued.
    pub async fn disconnect(&self) -> Result<(), ProtocolError> {
        tracing::info!(
            host = %self.inner.config.host,
            port = %self.inner.config.port,
            "Disconnecting from MQTT broker"
        );

        self.inner.listeners.close_all();
        self.inner.filters.lock().clear();
        self.inner.client.disconnect().await?;
        self.inner.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), ProtocolError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionFailed(format!(
                "not connected to {}:{}",
                self.inner.config.host, self.inner.config.port
            )))
        }
    }
}

impl MessageBus for MqttBus {
    async fn subscribe(&self, patterns: &[String]) -> Result<Subscription, ProtocolError> {
        self.ensure_connected()?;

        // Register before subscribing so retained messages sent right after
        // SUBACK are not lost.
        let subscription = self.inner.listeners.register(patterns);

        for pattern in patterns {
            if let Err(e) = self.inner.client.subscribe(pattern, QoS::AtLeastOnce).await {
                self.inner.listeners.remove(subscription.id());
                return Err(e.into());
            }
            *self.inner.filters.lock().entry(pattern.clone()).or_insert(0) += 1;
        }

        tracing::debug!(
            listener = subscription.id(),
            ?patterns,
            "Subscribed to topic filters"
        );
        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription: Subscription) -> Result<(), ProtocolError> {
        self.inner.listeners.remove(subscription.id());

        let released: Vec<String> = {
            let mut filters = self.inner.filters.lock();
            subscription
                .patterns()
                .iter()
                .filter(|pattern| match filters.get_mut(pattern.as_str()) {
                    Some(count) if *count > 1 => {
                        *count -= 1;
                        false
                    }
                    Some(_) => {
                        filters.remove(pattern.as_str());
                        true
                    }
                    None => false,
                })
                .cloned()
                .collect()
        };

        if !self.is_connected() {
            return Ok(());
        }

        for pattern in &released {
            if let Err(e) = self.inner.client.unsubscribe(pattern).await {
                tracing::warn!(filter = %pattern, error = %e, "Failed to unsubscribe");
            }
        }

        tracing::debug!(
            listener = subscription.id(),
            released = released.len(),
            "Unsubscribed listener"
        );
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), ProtocolError> {
        self.ensure_connected()?;

        tracing::debug!(
            topic = %topic,
            payload = %String::from_utf8_lossy(payload),
            retain,
            "Publishing message"
        );
        self.inner
            .client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for MqttBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttBus")
            .field("host", &self.inner.config.host)
            .field("port", &self.inner.config.port)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Builder for an [`MqttBus`].
#[derive(Debug, Default)]
pub struct MqttBusBuilder {
    config: MqttBusConfig,
}

impl MqttBusBuilder {
    /// Sets the broker host address.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the broker port (default: 1883).
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets authentication credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the keep-alive interval (default: 30 seconds).
    #[must_use]
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.config.keep_alive = duration;
        self
    }

    /// Sets the connection timeout (default: 10 seconds).
    #[must_use]
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connection_timeout = duration;
        self
    }

    /// Connects to the broker and waits for the CONNACK.
    ///
    /// # Errors
    ///
    /// Returns error if the host is empty, the connection is refused, or no
    /// CONNACK arrives within the connection timeout.
    pub async fn build(self) -> Result<MqttBus, ProtocolError> {
        if self.config.host.is_empty() {
            return Err(ProtocolError::InvalidAddress(
                "MQTT broker host is required".to_string(),
            ));
        }

        let counter = BUS_CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("tasmota_fleet_{}_{}", std::process::id(), counter);

        let mut mqtt_options = MqttOptions::new(&client_id, &self.config.host, self.config.port);
        mqtt_options.set_keep_alive(self.config.keep_alive);
        mqtt_options.set_clean_session(true);

        if let Some((ref username, ref password)) = self.config.credentials {
            mqtt_options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 64);

        let bus = MqttBus {
            inner: Arc::new(MqttBusInner {
                client,
                listeners: ListenerSet::default(),
                filters: Mutex::new(HashMap::new()),
                config: self.config.clone(),
                connected: AtomicBool::new(false),
            }),
        };

        let (connack_tx, connack_rx) = oneshot::channel();
        let events_bus = bus.clone();
        tokio::spawn(async move {
            handle_bus_events(event_loop, events_bus, Some(connack_tx)).await;
        });

        let timeout = self.config.connection_timeout;
        match tokio::time::timeout(timeout, connack_rx).await {
            Ok(Ok(())) => {
                tracing::info!(
                    host = %self.config.host,
                    port = %self.config.port,
                    client_id = %client_id,
                    "Connected to MQTT broker"
                );
                Ok(bus)
            }
            Ok(Err(_)) => Err(ProtocolError::ConnectionFailed(
                "MQTT event loop terminated before CONNACK".to_string(),
            )),
            Err(_) => Err(ProtocolError::ConnectionFailed(format!(
                "MQTT connection timeout after {}s",
                timeout.as_secs()
            ))),
        }
    }
}

/// Drives the rumqttc event loop until the connection ends.
///
/// Any error is terminal: listeners are closed so pending receivers observe
/// the end of the stream instead of waiting out their timers.
async fn handle_bus_events(
    mut event_loop: EventLoop,
    bus: MqttBus,
    connack_tx: Option<oneshot::Sender<()>>,
) {
    use rumqttc::{Event, Packet};

    let mut connack_tx = connack_tx;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "MQTT broker connected");
                bus.inner.connected.store(true, Ordering::Release);
                if let Some(tx) = connack_tx.take() {
                    let _ = tx.send(());
                }
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::trace!(?suback, "MQTT subscription acknowledged");
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                    retained: publish.retain,
                    received_at: Utc::now(),
                };
                let delivered = bus.inner.listeners.route(&message);
                tracing::trace!(
                    topic = %message.topic,
                    retained = message.retained,
                    delivered,
                    "MQTT message received"
                );
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::info!("MQTT broker disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if bus.is_connected() {
                    tracing::error!(error = %e, "MQTT event loop error");
                } else {
                    tracing::debug!(error = %e, "MQTT event loop stopped");
                }
                break;
            }
        }
    }

    bus.inner.connected.store(false, Ordering::Release);
    bus.inner.listeners.close_all();
}

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integration tests for the MQTT bus using mockforge-mqtt.

#![cfg(feature = "mqtt")]

use std::time::Duration;

use mockforge_mqtt::broker::MqttConfig;
use mockforge_mqtt::start_mqtt_server;
use tasmota_fleet::bus::{MessageBus, MqttBus};
use tokio::time::sleep;

/// Helper to find an available port for testing.
fn get_test_port() -> u16 {
    use std::sync::atomic::{AtomicU16, Ordering};
    static PORT_COUNTER: AtomicU16 = AtomicU16::new(18850);
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Starts a mock MQTT broker on the given port.
async fn start_mock_broker(port: u16) {
    let config = MqttConfig {
        port,
        host: "127.0.0.1".to_string(),
        ..Default::default()
    };

    tokio::spawn(async move {
        let _ = start_mqtt_server(config).await;
    });

    sleep(Duration::from_millis(500)).await;
}

async fn connect(port: u16) -> MqttBus {
    MqttBus::builder()
        .host("127.0.0.1")
        .port(port)
        .connection_timeout(Duration::from_secs(5))
        .build()
        .await
        .expect("connect to mock broker")
}

// ============================================================================
// Connection
// ============================================================================

mod connection {
    use super::*;

    #[tokio::test]
    async fn connect_to_broker() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let bus = connect(port).await;
        assert!(bus.is_connected());
        assert_eq!(bus.host(), "127.0.0.1");
        assert_eq!(bus.port(), port);
    }

    #[tokio::test]
    async fn empty_host_is_rejected() {
        let result = MqttBus::builder().host("").build().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unreachable_broker_fails() {
        // Nothing listens on this port.
        let result = MqttBus::builder()
            .host("127.0.0.1")
            .port(get_test_port())
            .connection_timeout(Duration::from_secs(1))
            .build()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn disconnect_closes_the_bus() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let bus = connect(port).await;
        bus.disconnect().await.unwrap();

        assert!(!bus.is_connected());
        assert!(bus.publish("cmnd/plugA/Power", b"ON", false).await.is_err());
        assert!(bus.subscribe(&["tele/+/LWT".to_string()]).await.is_err());
    }
}

// ============================================================================
// Bus operations
// ============================================================================
//
// The mockforge broker does not forward publishes between clients, so these
// tests cover the client side only. Acknowledgement routing is covered by
// the in-memory bus tests.

mod operations {
    use super::*;
    use tasmota_fleet::collector::{self, CollectOptions};
    use tasmota_fleet::command::{Command, CommandDispatcher, CommandOutcome, CommandRequest};
    use tasmota_fleet::topic::TopicLayout;
    use tasmota_fleet::types::DeviceId;

    #[tokio::test]
    async fn subscribe_publish_unsubscribe() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let bus = connect(port).await;
        let subscription = bus
            .subscribe(&["stat/+/RESULT".to_string()])
            .await
            .unwrap();
        bus.publish("cmnd/plugA/TelePeriod", b"", false).await.unwrap();
        bus.unsubscribe(subscription).await.unwrap();
    }

    #[tokio::test]
    async fn collect_ends_after_grace() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let bus = connect(port).await;
        let options = CollectOptions::new().with_grace(Duration::from_millis(300));
        let start = std::time::Instant::now();
        let collected = collector::collect(&bus, &TopicLayout::default().default_filters(), &options)
            .await
            .unwrap();

        assert!(collected.is_empty());
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn unanswered_command_times_out() {
        let port = get_test_port();
        start_mock_broker(port).await;

        let bus = connect(port).await;
        let dispatcher = CommandDispatcher::new(&bus, TopicLayout::default(), Duration::from_millis(300));
        let request = CommandRequest::new(vec![DeviceId::new("plugA")], Command::query("TelePeriod"));

        let results = dispatcher.send(&request).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[&DeviceId::new("plugA")].outcome, CommandOutcome::Timeout);
    }
}

// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use futures::future::{join, join_all};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{Command, CommandOutcome, CommandRequest, CommandResult, DispatchPlan};
use crate::bus::{Message, MessageBus};
use crate::error::ProtocolError;
use crate::topic::{TopicLayout, command_base};
use crate::types::DeviceId;

/// Publishes commands and matches acknowledgements to them.
///
/// Every dispatch subscribes to the acknowledgement topics before the first
/// publish, publishes all commands, then waits for all devices concurrently
/// against one shared deadline. A silent device costs at most that deadline
/// and never delays the results of the others.
#[derive(Debug)]
pub struct CommandDispatcher<'a, B: MessageBus> {
    bus: &'a B,
    layout: TopicLayout,
    default_timeout: Duration,
}

impl<'a, B: MessageBus> CommandDispatcher<'a, B> {
    /// Creates a dispatcher on an already connected bus.
    #[must_use]
    pub fn new(bus: &'a B, layout: TopicLayout, default_timeout: Duration) -> Self {
        Self {
            bus,
            layout,
            default_timeout,
        }
    }

    /// Returns the acknowledgement timeout used when a request sets none.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Sends one command to every target.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the bus fails; per-device failures are
    /// reported in the results.
    pub async fn send(
        &self,
        request: &CommandRequest,
    ) -> Result<BTreeMap<DeviceId, CommandResult>, ProtocolError> {
        let mut plan = DispatchPlan::from(request);
        let mut seen = BTreeSet::new();
        plan.steps.retain(|(device, _)| seen.insert(device.clone()));

        Ok(self
            .dispatch(&plan, false)
            .await?
            .into_iter()
            .map(|result| (result.device.clone(), result))
            .collect())
    }

    /// Sends several commands to one device, in order.
    ///
    /// Results are returned in command order even when the device
    /// acknowledges out of order.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if the bus fails.
    pub async fn send_sequence(
        &self,
        device: &DeviceId,
        commands: &[Command],
    ) -> Result<Vec<CommandResult>, ProtocolError> {
        let mut plan = DispatchPlan::new();
        for command in commands {
            plan.push(device.clone(), command.clone());
        }
        self.dispatch(&plan, false).await
    }

    /// Executes a plan and returns one result per step, in plan order.
    ///
    /// With `dry_run` set the bus is not touched and every result is
    /// [`CommandOutcome::WouldSend`].
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` if subscribing or publishing fails, or if the
    /// bus shuts down while waiting for acknowledgements.
    pub async fn dispatch(
        &self,
        plan: &DispatchPlan,
        dry_run: bool,
    ) -> Result<Vec<CommandResult>, ProtocolError> {
        if plan.is_empty() {
            return Ok(Vec::new());
        }

        let payloads: Vec<String> = plan.steps.iter().map(|(_, cmd)| cmd.payload()).collect();

        if dry_run {
            return Ok(plan
                .steps
                .iter()
                .zip(payloads)
                .map(|((device, command), payload)| {
                    tracing::info!(
                        device = %device,
                        topic = %self.layout.command_topic(device, &command.name),
                        %payload,
                        "Dry run, not publishing"
                    );
                    CommandResult {
                        device: device.clone(),
                        command: command.name.clone(),
                        payload,
                        outcome: CommandOutcome::WouldSend,
                        response: None,
                    }
                })
                .collect());
        }

        let mut subscription = self.bus.subscribe(&self.ack_filters(plan)).await?;
        let (router, receivers) = AckRouter::new(&self.layout, plan);

        for ((device, command), payload) in plan.steps.iter().zip(&payloads) {
            let topic = self.layout.command_topic(device, &command.name);
            tracing::debug!(device = %device, %topic, %payload, "Publishing command");
            if let Err(e) = self.bus.publish(&topic, payload.as_bytes(), false).await {
                if let Err(unsubscribe) = self.bus.unsubscribe(subscription).await {
                    tracing::warn!(error = %unsubscribe, "Failed to release acknowledgement subscription");
                }
                return Err(e);
            }
        }

        let timeout = plan.timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        let demux = async {
            while !router.is_complete() {
                match tokio::time::timeout_at(deadline, subscription.recv()).await {
                    Ok(Some(message)) => router.route(&message),
                    Ok(None) => {
                        router.abandon();
                        return true;
                    }
                    Err(_) => break,
                }
            }
            false
        };
        let waiters = join_all(receivers.into_iter().map(|rx| async move {
            tokio::time::timeout_at(deadline, rx).await.ok().and_then(Result::ok)
        }));

        let (bus_closed, acks) = join(demux, waiters).await;
        if bus_closed {
            return Err(ProtocolError::ChannelClosed(
                "bus closed while awaiting acknowledgements".to_string(),
            ));
        }
        self.bus.unsubscribe(subscription).await?;

        let results: Vec<CommandResult> = plan
            .steps
            .iter()
            .zip(payloads)
            .zip(acks)
            .map(|(((device, command), payload), ack)| {
                let (outcome, response) = match ack {
                    Some(ack) => (ack.outcome, Some(ack.response)),
                    None => (CommandOutcome::Timeout, None),
                };
                match &outcome {
                    CommandOutcome::Success => {
                        tracing::debug!(device = %device, command = %command.name, "Acknowledged");
                    }
                    other => {
                        tracing::warn!(
                            device = %device,
                            command = %command.name,
                            outcome = %other,
                            "Command not acknowledged"
                        );
                    }
                }
                CommandResult {
                    device: device.clone(),
                    command: command.name.clone(),
                    payload,
                    outcome,
                    response,
                }
            })
            .collect();

        let succeeded = results.iter().filter(|r| r.outcome.is_success()).count();
        tracing::info!(
            commands = results.len(),
            succeeded,
            failed = results.len() - succeeded,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Dispatch finished"
        );
        Ok(results)
    }

    /// `stat/+/RESULT` plus `stat/+/<BASE>` for every command base in the
    /// plan, for devices with `SetOption4` enabled.
    fn ack_filters(&self, plan: &DispatchPlan) -> Vec<String> {
        let mut filters = BTreeSet::new();
        filters.insert(self.layout.status_filter("RESULT"));
        for (_, command) in &plan.steps {
            let base = command_base(&command.name).to_ascii_uppercase();
            filters.insert(self.layout.status_filter(&base));
        }
        filters.into_iter().collect()
    }
}

#[derive(Debug)]
struct Ack {
    outcome: CommandOutcome,
    response: String,
}

struct PendingAck {
    name: String,
    base: String,
    tx: oneshot::Sender<Ack>,
}

/// Routes acknowledgements to the oldest matching pending command of the
/// answering device. Each pending entry is completed at most once.
struct AckRouter<'l> {
    layout: &'l TopicLayout,
    pending: Mutex<HashMap<DeviceId, VecDeque<PendingAck>>>,
}

impl<'l> AckRouter<'l> {
    fn new(layout: &'l TopicLayout, plan: &DispatchPlan) -> (Self, Vec<oneshot::Receiver<Ack>>) {
        let mut pending: HashMap<DeviceId, VecDeque<PendingAck>> = HashMap::new();
        let mut receivers = Vec::with_capacity(plan.len());

        for (device, command) in &plan.steps {
            let (tx, rx) = oneshot::channel();
            pending.entry(device.clone()).or_default().push_back(PendingAck {
                name: command.name.clone(),
                base: command_base(&command.name).to_string(),
                tx,
            });
            receivers.push(rx);
        }

        (
            Self {
                layout,
                pending: Mutex::new(pending),
            },
            receivers,
        )
    }

    fn is_complete(&self) -> bool {
        self.pending.lock().values().all(VecDeque::is_empty)
    }

    /// Drops every pending sender so waiters finish immediately.
    fn abandon(&self) {
        self.pending.lock().clear();
    }

    fn route(&self, message: &Message) {
        if message.retained {
            return;
        }
        let parts: Vec<&str> = message.topic.split('/').collect();
        let &[prefix, device, suffix] = parts.as_slice() else {
            return;
        };
        if prefix != self.layout.status {
            return;
        }

        let mut pending = self.pending.lock();
        let Some(queue) = pending.get_mut(&DeviceId::new(device)) else {
            return;
        };
        if queue.is_empty() {
            return;
        }

        let text = message.payload_lossy().trim().to_string();
        let object = match serde_json::from_str(&text) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            _ => None,
        };
        let keys: Vec<&str> = object
            .as_ref()
            .map(|map| map.keys().map(String::as_str).collect())
            .unwrap_or_default();
        let suffix_base = (suffix != "RESULT").then(|| command_base(suffix));

        let rejection = object
            .as_ref()
            .and_then(|map| map.get("Command"))
            .and_then(serde_json::Value::as_str)
            .filter(|reason| reason.eq_ignore_ascii_case("Unknown") || reason.eq_ignore_ascii_case("Error"));

        let matched = queue
            .iter()
            .position(|p| keys.iter().any(|k| k.eq_ignore_ascii_case(&p.name)))
            .or_else(|| {
                queue.iter().position(|p| {
                    keys.iter()
                        .any(|k| command_base(k).eq_ignore_ascii_case(&p.base))
                        || suffix_base.is_some_and(|s| s.eq_ignore_ascii_case(&p.base))
                })
            });
        let index = match (matched, rejection) {
            (Some(index), _) => index,
            // A rejection does not name the command; it answers the oldest one.
            (None, Some(_)) => 0,
            (None, None) => {
                tracing::trace!(device, topic = %message.topic, "Ignoring unrelated status message");
                return;
            }
        };

        let Some(entry) = queue.remove(index) else {
            return;
        };

        let outcome = match rejection {
            Some(reason) => CommandOutcome::Rejected(reason.to_string()),
            None => CommandOutcome::Success,
        };

        tracing::trace!(device, command = %entry.name, %outcome, "Acknowledgement matched");
        let _ = entry.tx.send(Ack {
            outcome,
            response: text,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::types::{PowerIndex, PowerState};

    fn dispatcher(bus: &MemoryBus) -> CommandDispatcher<'_, MemoryBus> {
        CommandDispatcher::new(bus, TopicLayout::default(), Duration::from_secs(2))
    }

    fn reply(
        topic: &'static str,
        payload: &'static str,
    ) -> impl Fn(&Message) -> Vec<Message> + Send + Sync + 'static {
        move |_| vec![Message::new(topic, payload, false)]
    }

    #[tokio::test(start_paused = true)]
    async fn one_success_one_timeout_within_deadline() {
        let bus = MemoryBus::new();
        bus.respond(
            "cmnd/a/+",
            Duration::from_millis(50),
            reply("stat/a/RESULT", r#"{"POWER":"ON"}"#),
        );

        let start = Instant::now();
        let request = CommandRequest::new(
            vec!["a".into(), "b".into()],
            Command::power(PowerIndex::first(), PowerState::On),
        );
        let results = dispatcher(&bus).send(&request).await.unwrap();

        assert_eq!(results[&DeviceId::new("a")].outcome, CommandOutcome::Success);
        assert_eq!(
            results[&DeviceId::new("a")].response.as_deref(),
            Some(r#"{"POWER":"ON"}"#)
        );
        assert_eq!(results[&DeviceId::new("b")].outcome, CommandOutcome::Timeout);
        assert!(start.elapsed() <= Duration::from_secs(2) + Duration::from_millis(10));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_everything_acknowledged() {
        let bus = MemoryBus::new();
        bus.respond(
            "cmnd/a/TelePeriod",
            Duration::from_millis(100),
            reply("stat/a/RESULT", r#"{"TelePeriod":300}"#),
        );

        let start = Instant::now();
        let request = CommandRequest::new(vec!["a".into()], Command::query("TelePeriod"))
            .with_timeout(Duration::from_secs(30));
        dispatcher(&bus).send(&request).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_command_is_rejected() {
        let bus = MemoryBus::new();
        bus.respond(
            "cmnd/a/Frobnicate",
            Duration::ZERO,
            reply("stat/a/RESULT", r#"{"Command":"Unknown"}"#),
        );

        let results = dispatcher(&bus)
            .send(&CommandRequest::new(vec!["a".into()], Command::query("Frobnicate")))
            .await
            .unwrap();
        assert_eq!(
            results[&DeviceId::new("a")].outcome,
            CommandOutcome::Rejected("Unknown".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn power_echo_does_not_answer_other_commands() {
        let bus = MemoryBus::new();
        bus.respond("cmnd/a/Power1", Duration::ZERO, |_| {
            vec![
                Message::new("stat/a/RESULT", r#"{"POWER":"ON"}"#, false),
                Message::new("stat/a/POWER", "ON", false),
            ]
        });

        let results = dispatcher(&bus)
            .send_sequence(
                &"a".into(),
                &[
                    Command::power(PowerIndex::first(), PowerState::On),
                    Command::query("TelePeriod"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(results[0].outcome, CommandOutcome::Success);
        assert_eq!(results[1].outcome, CommandOutcome::Timeout);
        assert_eq!(results[1].response, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_result_is_ignored() {
        let bus = MemoryBus::new();
        bus.respond(
            "cmnd/a/TelePeriod",
            Duration::from_millis(10),
            reply("stat/a/RESULT", r#"{"POWER":"OFF"}"#),
        );

        let results = dispatcher(&bus)
            .send(&CommandRequest::new(vec!["a".into()], Command::query("TelePeriod")))
            .await
            .unwrap();
        assert_eq!(results[&DeviceId::new("a")].outcome, CommandOutcome::Timeout);
    }

    /// Accepts subscriptions but refuses every publish.
    struct PublishFails(MemoryBus);

    impl MessageBus for PublishFails {
        async fn subscribe(
            &self,
            patterns: &[String],
        ) -> Result<crate::bus::Subscription, ProtocolError> {
            self.0.subscribe(patterns).await
        }

        async fn unsubscribe(&self, subscription: crate::bus::Subscription) -> Result<(), ProtocolError> {
            self.0.unsubscribe(subscription).await
        }

        async fn publish(&self, _: &str, _: &[u8], _: bool) -> Result<(), ProtocolError> {
            Err(ProtocolError::ConnectionFailed("refused".to_string()))
        }
    }

    #[tokio::test]
    async fn failed_publish_releases_subscription() {
        let bus = PublishFails(MemoryBus::new());
        let dispatcher = CommandDispatcher::new(&bus, TopicLayout::default(), Duration::from_secs(2));

        let err = dispatcher
            .send(&CommandRequest::new(vec!["a".into()], Command::upgrade()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionFailed(_)));
        assert_eq!(bus.0.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_acks_out_of_order() {
        let bus = MemoryBus::new();
        bus.respond(
            "cmnd/a/Timer1",
            Duration::from_millis(300),
            reply("stat/a/RESULT", r#"{"Timer1":{"Enable":1}}"#),
        );
        bus.respond(
            "cmnd/a/Timer2",
            Duration::from_millis(10),
            reply("stat/a/RESULT", r#"{"Timer2":{"Enable":0}}"#),
        );

        let results = dispatcher(&bus)
            .send_sequence(
                &"a".into(),
                &[Command::query("Timer1"), Command::query("Timer2")],
            )
            .await
            .unwrap();

        assert_eq!(results[0].command, "Timer1");
        assert_eq!(results[0].response.as_deref(), Some(r#"{"Timer1":{"Enable":1}}"#));
        assert_eq!(results[1].response.as_deref(), Some(r#"{"Timer2":{"Enable":0}}"#));

        let published: Vec<String> = bus.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(published, vec!["cmnd/a/Timer1", "cmnd/a/Timer2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn setoption4_ack_on_command_topic() {
        let bus = MemoryBus::new();
        bus.respond(
            "cmnd/a/Timer3",
            Duration::ZERO,
            reply("stat/a/TIMER", r#"{"Timer3":{"Enable":0}}"#),
        );

        let results = dispatcher(&bus)
            .send(&CommandRequest::new(vec!["a".into()], Command::query("Timer3")))
            .await
            .unwrap();
        assert!(results[&DeviceId::new("a")].outcome.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn retained_stale_ack_is_ignored() {
        let bus = MemoryBus::new();
        bus.seed_retained("stat/a/RESULT", r#"{"POWER":"ON"}"#);

        let results = dispatcher(&bus)
            .send(&CommandRequest::new(vec!["a".into()], Command::query("Power")))
            .await
            .unwrap();
        assert_eq!(results[&DeviceId::new("a")].outcome, CommandOutcome::Timeout);
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let bus = MemoryBus::new();
        let mut plan = DispatchPlan::new();
        plan.push("a".into(), Command::upgrade());

        let results = dispatcher(&bus).dispatch(&plan, true).await.unwrap();
        assert_eq!(results[0].outcome, CommandOutcome::WouldSend);
        assert_eq!(results[0].payload, "1");
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn disconnected_bus_is_fatal() {
        let bus = MemoryBus::new();
        bus.disconnect();
        let request = CommandRequest::new(vec!["a".into()], Command::upgrade());
        assert!(dispatcher(&bus).send(&request).await.is_err());
    }

    #[test]
    fn filters_cover_result_and_command_bases() {
        let bus = MemoryBus::new();
        let mut plan = DispatchPlan::new();
        plan.push("a".into(), Command::query("Timer1"));
        plan.push("a".into(), Command::query("Timer2"));
        plan.push("a".into(), Command::query("TimeDST"));

        assert_eq!(
            dispatcher(&bus).ack_filters(&plan),
            vec!["stat/+/RESULT", "stat/+/TIMEDST", "stat/+/TIMER"]
        );
    }
}

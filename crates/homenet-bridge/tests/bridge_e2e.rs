//! End-to-end bus scenarios over the in-memory transport and broker.
//!
//! Bytes go in on the device side of a memory pair, retained state comes out
//! of the channel broker, and outbound frames come back to the device side.
//! All timing runs on the paused clock.

use std::sync::Arc;
use std::time::Duration;

use homenet_bridge::{
    Bus, ByteTransport, ChannelBroker, MemoryTransport, memory_pair,
    broker::{InboundMessage, OutboundMessage},
    config::BridgeConfig,
};
use homenet_core::script::NullEngine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

struct Harness {
    device: MemoryTransport,
    published: mpsc::UnboundedReceiver<OutboundMessage>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    bus: JoinHandle<Result<(), homenet_bridge::BusError>>,
}

fn spawn_bus(yaml: &str) -> Harness {
    let config = BridgeConfig::from_yaml(yaml).unwrap();
    let (bus_side, device) = memory_pair();
    let (broker, published, inbound) = ChannelBroker::new();
    let bus = Bus::new(config, bus_side, broker, Arc::new(NullEngine), "homenet").unwrap();
    Harness { device, published, inbound, bus: tokio::spawn(bus.run()) }
}

impl Harness {
    async fn feed(&mut self, bytes: &[u8]) {
        self.device.send(bytes).await.unwrap();
    }

    async fn next_write(&mut self) -> Vec<u8> {
        timeout(Duration::from_secs(120), self.device.recv())
            .await
            .expect("no write within window")
            .expect("transport closed")
            .to_vec()
    }

    /// Next publish on `topic`, skipping other traffic (raw-packet events,
    /// availability).
    async fn next_publish_on(&mut self, topic: &str) -> OutboundMessage {
        loop {
            let message = timeout(Duration::from_secs(120), self.published.recv())
                .await
                .expect("no publish within window")
                .expect("broker closed");
            if message.topic == topic {
                return message;
            }
        }
    }

    fn drain_published(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.published.try_recv() {
            messages.push(message);
        }
        messages
    }
}

async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn packet_trigger_sends_packet() {
    // Door-bell trigger: AD 5A 00 77 in, B0 5A 00 6A answer.
    let mut harness = spawn_bus(
        r"
homenet_bridge:
  packet_defaults: {rx_length: 4, rx_checksum: samsung_rx}
  automation:
    - trigger: [{packet: {match: {data: [0xAD, 0x5A, 0x00, 0x77]}}}]
      then: [{send_packet: {data: [0xB0, 0x5A, 0x00, 0x6A]}}]
",
    );

    harness.feed(&[0xAD, 0x5A, 0x00, 0x77]).await;
    assert_eq!(harness.next_write().await, vec![0xB0, 0x5A, 0x00, 0x6A]);

    // Exactly one outbound write: nothing further arrives.
    settle().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    let extra = timeout(Duration::from_millis(10), harness.device.recv()).await;
    assert!(extra.is_err(), "unexpected second write");
}

#[tokio::test(start_paused = true)]
async fn restart_rule_issues_one_eventual_command() {
    // Elevator call. Two state changes within a second; restart mode cancels
    // the first invocation's delay, so command_off is sent exactly once,
    // ~20 s after the second trigger.
    let mut harness = spawn_bus(
        r#"
homenet_bridge:
  packet_defaults: {rx_length: 2}
  switch:
    - id: elevator_call
      state: {offset: 0, data: [0xE1]}
      state_on: {offset: 1, data: [0x01]}
      command_off: {data: [0xE1, 0x00]}
  automation:
    - mode: restart
      trigger:
        - state: {entity_id: elevator_call, property: state, match: "ON"}
      then:
        - send_packet: {data: [0x0A, 0x01]}
        - delay: 20s
        - command: "id(elevator_call).command_off()"
"#,
    );

    harness.feed(&[0xE1, 0x01]).await;
    assert_eq!(harness.next_write().await, vec![0x0A, 0x01]);

    tokio::time::sleep(Duration::from_millis(500)).await;
    harness.feed(&[0xE1, 0x01]).await;
    assert_eq!(harness.next_write().await, vec![0x0A, 0x01]);

    // The surviving invocation completes its delay and commands off.
    assert_eq!(harness.next_write().await, vec![0xE1, 0x00]);

    // No second command_off from the cancelled invocation.
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    let extra = timeout(Duration::from_millis(10), harness.device.recv()).await;
    assert!(extra.is_err(), "cancelled invocation still commanded");
}

#[tokio::test(start_paused = true)]
async fn fan_packet_publishes_full_state() {
    let mut harness = spawn_bus(
        r"
homenet_bridge:
  packet_defaults: {rx_length: 5}
  fan:
    - id: living_fan
      state: {offset: 0, data: [0x40]}
      state_on: {offset: 1, data: [0x01]}
      state_speed: {offset: 2, length: 1}
      state_oscillating: {offset: 3, data: [0x01]}
      state_direction: {offset: 4, data: [0x00]}
",
    );

    harness.feed(&[0x40, 0x01, 0x32, 0x01, 0x00]).await;
    let state = harness.next_publish_on("homenet/living_fan/state").await;
    assert!(state.retain);
    assert_eq!(
        state.payload,
        r#"{"direction":"forward","oscillating":true,"speed":50,"state":"ON"}"#
    );
}

#[tokio::test(start_paused = true)]
async fn climate_masked_packet_publishes_temperatures() {
    let mut harness = spawn_bus(
        r"
homenet_bridge:
  packet_defaults: {rx_length: 8}
  climate:
    - id: bedroom
      state: {data: [0x80, 0x00, 0x04], mask: [0xF9, 0x00, 0xFF]}
      state_temperature_current: {offset: 3, decode: bcd}
      state_temperature_target: {offset: 4, decode: bcd}
      state_off: {offset: 1, data: [0x80]}
",
    );

    harness.feed(&[0x82, 0x80, 0x04, 0x22, 0x15, 0x00, 0x00, 0x3D]).await;
    let state = harness.next_publish_on("homenet/bedroom/state").await;
    assert_eq!(
        state.payload,
        r#"{"current_temperature":22,"mode":"off","target_temperature":15}"#
    );
}

#[tokio::test(start_paused = true)]
async fn identical_packets_publish_state_once() {
    let mut harness = spawn_bus(
        r"
homenet_bridge:
  packet_defaults: {rx_length: 2}
  switch:
    - id: sw
      state: {offset: 0, data: [0xE1]}
      state_on: {offset: 1, data: [0x01]}
",
    );

    harness.feed(&[0xE1, 0x01]).await;
    harness.next_publish_on("homenet/sw/state").await;
    harness.feed(&[0xE1, 0x01]).await;
    settle().await;

    let repeats = harness
        .drain_published()
        .into_iter()
        .filter(|m| m.topic == "homenet/sw/state")
        .count();
    assert_eq!(repeats, 0, "identical merge published again");
}

#[tokio::test(start_paused = true)]
async fn inbound_set_assembles_framed_command() {
    let mut harness = spawn_bus(
        r"
homenet_bridge:
  packet_defaults:
    rx_length: 2
    tx_header: [0xF7]
    tx_checksum: add
  light:
    - id: lamp
      state: {offset: 0, data: [0x31]}
      command_on: {data: [0x31, 0x01]}
",
    );
    settle().await;

    harness
        .inbound
        .send(InboundMessage { topic: "homenet/lamp/set".into(), payload: "ON".into() })
        .unwrap();
    // F7 31 01 + add checksum 0x29.
    assert_eq!(harness.next_write().await, vec![0xF7, 0x31, 0x01, 0x29]);
}

#[tokio::test(start_paused = true)]
async fn optimistic_set_updates_state_without_wire_traffic() {
    let mut harness = spawn_bus(
        r"
homenet_bridge:
  packet_defaults: {rx_length: 2}
  switch:
    - id: virtual_sw
      optimistic: true
",
    );

    // Startup seed publishes OFF.
    let seeded = harness.next_publish_on("homenet/virtual_sw/state").await;
    assert_eq!(seeded.payload, r#"{"state":"OFF"}"#);

    harness
        .inbound
        .send(InboundMessage { topic: "homenet/virtual_sw/set".into(), payload: "ON".into() })
        .unwrap();
    let state = harness.next_publish_on("homenet/virtual_sw/state").await;
    assert_eq!(state.payload, r#"{"state":"ON"}"#);

    settle().await;
    let write = timeout(Duration::from_millis(10), harness.device.recv()).await;
    assert!(write.is_err(), "optimistic command reached the wire");
}

#[tokio::test(start_paused = true)]
async fn unacked_command_retries_then_fails() {
    let mut harness = spawn_bus(
        r"
homenet_bridge:
  packet_defaults: {rx_length: 2}
  light:
    - id: lamp
      state: {offset: 0, data: [0x31]}
      command_on: {data: [0x31, 0x01]}
      ack: {offset: 0, data: [0xB1]}
",
    );
    settle().await;

    harness
        .inbound
        .send(InboundMessage { topic: "homenet/lamp/set".into(), payload: "ON".into() })
        .unwrap();

    // Initial send plus two backoff retries, then the failure event.
    assert_eq!(harness.next_write().await, vec![0x31, 0x01]);
    assert_eq!(harness.next_write().await, vec![0x31, 0x01]);
    assert_eq!(harness.next_write().await, vec![0x31, 0x01]);
    let failed = harness.next_publish_on("homenet/bridge/command_failed").await;
    assert_eq!(failed.payload, r#"{"entity_id":"lamp","command":"on"}"#);
}

#[tokio::test(start_paused = true)]
async fn matching_ack_clears_pending() {
    let mut harness = spawn_bus(
        r"
homenet_bridge:
  packet_defaults: {rx_length: 2}
  light:
    - id: lamp
      state: {offset: 0, data: [0x31]}
      command_on: {data: [0x31, 0x01]}
      ack: {offset: 0, data: [0xB1]}
",
    );
    settle().await;

    harness
        .inbound
        .send(InboundMessage { topic: "homenet/lamp/set".into(), payload: "ON".into() })
        .unwrap();
    assert_eq!(harness.next_write().await, vec![0x31, 0x01]);

    // The device acknowledges; no retries follow.
    harness.feed(&[0xB1, 0x01]).await;
    settle().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    let extra = timeout(Duration::from_millis(10), harness.device.recv()).await;
    assert!(extra.is_err(), "acknowledged command was retried");
}

#[tokio::test(start_paused = true)]
async fn availability_lifecycle() {
    let mut harness = spawn_bus(
        r"
homenet_bridge:
  packet_defaults: {rx_length: 2}
  switch:
    - id: sw
      state: {offset: 0, data: [0xE1]}
",
    );

    let online = harness.next_publish_on("homenet/sw/availability").await;
    assert_eq!(online.payload, "online");
    assert!(online.retain);

    // Closing the transport shuts the bus down cleanly.
    let (placeholder, _unused) = memory_pair();
    drop(std::mem::replace(&mut harness.device, placeholder));
    std::future::poll_fn(|cx| std::pin::Pin::new(&mut harness.bus).poll(cx))
        .await
        .unwrap()
        .unwrap();
    let offline = harness.next_publish_on("homenet/sw/availability").await;
    assert_eq!(offline.payload, "offline");
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_flushes_pending_candidate() {
    // Checksum-sweep bus: a noise byte ahead of a valid frame resolves only
    // once the inter-byte idle elapses.
    let mut harness = spawn_bus(
        r"
homenet_bridge:
  packet_defaults: {rx_min_length: 3, rx_checksum: add, rx_timeout_ms: 50}
  sensor:
    - id: meter
      state: {offset: 0, data: [0xB0]}
      state_value: {offset: 1, length: 1}
",
    );

    harness.feed(&[0x01, 0xB0, 0x05, 0xB5]).await;
    settle().await;
    // Nothing yet: the parser is holding the candidate.
    assert!(
        harness.drain_published().iter().all(|m| m.topic != "homenet/meter/state"),
        "published before idle flush"
    );

    tokio::time::sleep(Duration::from_millis(60)).await;
    settle().await;
    let state = harness.next_publish_on("homenet/meter/state").await;
    assert_eq!(state.payload, r#"{"state":5}"#);
}

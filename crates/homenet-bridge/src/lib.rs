//! Bridge runtime: configuration, transports, broker seam, and the per-bus
//! event loop.
//!
//! The library half of the `homenet-bridge` binary. The runtime wires the
//! core pipeline together:
//!
//! ```text
//! bytes ── FrameParser ── matchers ── StateStore ── broker publish
//!              │                          │
//!              └──── AutomationEngine ◄───┘
//!                          │
//!                          └── CommandAssembler ── bytes
//! ```
//!
//! The serial link and the broker client are external collaborators consumed
//! through [`transport::ByteTransport`] and [`broker::Broker`]; in-memory
//! implementations of both ship here for tests and standalone runs.

pub mod broker;
pub mod bus;
pub mod config;
pub mod transport;

pub use broker::{Broker, ChannelBroker, LogBroker, Topics};
pub use bus::{Bus, BusError};
pub use config::{BridgeConfig, ConfigError, SerialConfig};
pub use transport::{ByteTransport, MemoryTransport, TcpSerialTransport, TransportError, memory_pair};

/// Default topic prefix; overridden by `MQTT_TOPIC_PREFIX`.
pub const DEFAULT_TOPIC_PREFIX: &str = "homenet";

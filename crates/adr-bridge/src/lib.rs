//! `adr-bridge` – device-side plumbing for the ADR controller.
//!
//! Moves data between the ADR controller's ZeroMQ endpoints and the
//! [`adr_registry::VariableRegistry`] without caring what is on the other
//! side of the registry.
//!
//! # Modules
//!
//! - [`transport`] – ZeroMQ SUB/REQ sockets behind small async traits.
//! - [`status_bridge`] – status stream → registry, with change suppression
//!   and a supervised reconnect loop.
//! - [`dispatcher`] – operator writes → fire-and-forget device commands.
//! - [`gateway`] – JSON-over-WebSocket operator access to the registry.
//! - [`backoff`] / [`shutdown`] – reconnect pacing and the shared stop signal.

pub mod backoff;
pub mod dispatcher;
pub mod gateway;
pub mod shutdown;
pub mod status_bridge;
pub mod transport;

pub use backoff::Backoff;
pub use dispatcher::{CommandDispatcher, DispatcherConfig, StartCyclePolicy};
pub use gateway::{GatewayReply, GatewayRequest, OperatorGateway};
pub use shutdown::wait_for_shutdown;
pub use status_bridge::{ApplyReport, StatusBridge, StatusBridgeConfig};
pub use transport::{
    ControlChannel, StatusConnector, StatusSource, ZmqControlChannel, ZmqStatusSource, ZmqSubscriber,
    tcp_endpoint,
};

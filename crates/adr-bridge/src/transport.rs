//! Transport seams between the bridge and the device process.
//!
//! The bridge never talks to ZeroMQ directly.  The status loop reads from a
//! [`StatusSource`] obtained through a [`StatusConnector`], and commands go out
//! through a [`ControlChannel`].  Production uses the ZeroMQ implementations
//! below; tests plug in channel-backed doubles.
//!
//! # Overview
//!
//! | Trait | ZeroMQ implementation | Socket |
//! |---|---|---|
//! | [`StatusConnector`] | [`ZmqSubscriber`] | `SUB`, subscribed to every topic |
//! | [`StatusSource`] | [`ZmqStatusSource`] | the connected `SUB` socket |
//! | [`ControlChannel`] | [`ZmqControlChannel`] | fresh `REQ` per command, reply never read |

use adr_types::AdrError;
use async_trait::async_trait;
use tracing::debug;
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

/// `tcp://host:port`.
pub fn tcp_endpoint(host: &str, port: u16) -> String {
    format!("tcp://{host}:{port}")
}

/// A connected stream of whole status-message payloads.
///
/// # Contract
///
/// * `recv` suspends until one message is available and must be
///   cancel-safe: the status loop races it against a read timeout and drops
///   the future when the timeout wins.
/// * An `Err` means the subscription is unusable; the caller reconnects.
#[async_trait]
pub trait StatusSource: Send {
    async fn recv(&mut self) -> Result<Vec<u8>, AdrError>;
}

/// Opens [`StatusSource`]s; called again after every lost subscription.
#[async_trait]
pub trait StatusConnector: Send + Sync {
    type Source: StatusSource;

    async fn connect(&self) -> Result<Self::Source, AdrError>;

    /// Human-readable target used in log lines.
    fn endpoint(&self) -> String;
}

/// One-way request path to the device's control endpoint.
///
/// # Contract
///
/// * Each `send` opens its own connection, delivers `payload` and closes
///   without reading a reply.
/// * `Ok` means the transport accepted the bytes, not that the device acted.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    async fn send(&self, payload: String) -> Result<(), AdrError>;

    fn endpoint(&self) -> String;
}

// ────────────────────────────────────────────────────────────────────────────
// ZeroMQ
// ────────────────────────────────────────────────────────────────────────────

fn transport_error(endpoint: &str, e: impl std::fmt::Display) -> AdrError {
    AdrError::Transport {
        endpoint: endpoint.to_string(),
        details: e.to_string(),
    }
}

/// Connects `SUB` sockets to the device's status publisher.
#[derive(Debug, Clone)]
pub struct ZmqSubscriber {
    endpoint: String,
}

impl ZmqSubscriber {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl StatusConnector for ZmqSubscriber {
    type Source = ZmqStatusSource;

    async fn connect(&self) -> Result<ZmqStatusSource, AdrError> {
        let mut socket = SubSocket::new();
        socket
            .connect(&self.endpoint)
            .await
            .map_err(|e| transport_error(&self.endpoint, e))?;
        socket
            .subscribe("")
            .await
            .map_err(|e| transport_error(&self.endpoint, e))?;
        debug!(endpoint = %self.endpoint, "status subscription open");
        Ok(ZmqStatusSource {
            endpoint: self.endpoint.clone(),
            socket,
        })
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

/// A live `SUB` socket.
pub struct ZmqStatusSource {
    endpoint: String,
    socket: SubSocket,
}

#[async_trait]
impl StatusSource for ZmqStatusSource {
    /// Multipart messages carry the payload in their last frame.
    async fn recv(&mut self) -> Result<Vec<u8>, AdrError> {
        let message = self
            .socket
            .recv()
            .await
            .map_err(|e| transport_error(&self.endpoint, e))?;
        message
            .into_vec()
            .pop()
            .map(|frame| frame.to_vec())
            .ok_or_else(|| transport_error(&self.endpoint, "empty message"))
    }
}

/// Sends each command on a short-lived `REQ` socket.
#[derive(Debug, Clone)]
pub struct ZmqControlChannel {
    endpoint: String,
}

impl ZmqControlChannel {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ControlChannel for ZmqControlChannel {
    async fn send(&self, payload: String) -> Result<(), AdrError> {
        let mut socket = ReqSocket::new();
        socket
            .connect(&self.endpoint)
            .await
            .map_err(|e| transport_error(&self.endpoint, e))?;
        socket
            .send(ZmqMessage::from(payload))
            .await
            .map_err(|e| transport_error(&self.endpoint, e))?;
        // The reply is never read; dropping the socket closes the connection.
        drop(socket);
        Ok(())
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_endpoint_formats_host_and_port() {
        assert_eq!(tcp_endpoint("10.66.48.41", 5021), "tcp://10.66.48.41:5021");
    }
}

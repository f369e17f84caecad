//! [`OperatorGateway`] – JSON-over-WebSocket access to the registry.
//!
//! A lightweight stand-in for the supervisory network so operators and
//! scripts can watch and write the ADR variables:
//!
//! 1. On connect the client receives one `snapshot` frame with every
//!    variable.
//! 2. Every registry write is then pushed as an `update` frame.
//! 3. The client may send requests:
//!
//! | Request | Reply |
//! |---|---|
//! | `{"op":"get","name":"TEMP"}` | `{"op":"value","name":"TEMP","value":0.1}` |
//! | `{"op":"put","name":"PAUSE","value":1}` | `{"op":"ack","name":"PAUSE"}` |
//! | `{"op":"list"}` | `{"op":"snapshot","variables":[..]}` |
//!
//! A `put` goes through [`VariableRegistry::put`], so it triggers device
//! commands exactly like a write from the supervisory network.  Bad requests
//! get an `error` frame; they never close the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use adr_registry::{VariableInfo, VariableRegistry};
use adr_types::{AdrError, PvName, Value, VariableUpdate};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::shutdown::wait_for_shutdown;

/// Client → gateway.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum GatewayRequest {
    Get { name: String },
    Put { name: String, value: Value },
    List,
}

/// Gateway → client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum GatewayReply {
    Snapshot { variables: Vec<VariableInfo> },
    Update(VariableUpdate),
    Value { name: PvName, value: Value },
    Ack { name: PvName },
    Error { message: String },
}

/// WebSocket server exposing a [`VariableRegistry`].
#[derive(Clone)]
pub struct OperatorGateway {
    registry: Arc<VariableRegistry>,
}

impl OperatorGateway {
    pub fn new(registry: Arc<VariableRegistry>) -> Self {
        Self { registry }
    }

    /// Bind `addr` and serve clients until `shutdown`.
    ///
    /// # Errors
    ///
    /// [`AdrError::Transport`] if the listener cannot be bound.
    pub async fn run(self, addr: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<(), AdrError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| AdrError::Transport {
            endpoint: addr.to_string(),
            details: format!("gateway bind error: {e}"),
        })?;
        info!(addr = %addr, "operator gateway listening");
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let gateway = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gateway.handle_client(stream, peer, shutdown).await {
                            error!(peer = %peer, error = %e, "gateway client error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "gateway accept error");
                }
            }
        }
        debug!("operator gateway stopped");
    }

    async fn handle_client(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), AdrError> {
        let ws_stream = accept_async(stream).await.map_err(|e| AdrError::Transport {
            endpoint: peer.to_string(),
            details: format!("ws handshake: {e}"),
        })?;
        debug!(peer = %peer, "gateway client connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        // Subscribe before the snapshot so no write falls between the two.
        let mut updates = self.registry.subscribe();

        let snapshot = GatewayReply::Snapshot {
            variables: self.registry.snapshot(),
        };
        if ws_tx.send(Message::Text(encode(&snapshot)?.into())).await.is_err() {
            return Ok(());
        }

        loop {
            let outgoing = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                result = updates.recv() => match result {
                    Ok(update) => GatewayReply::Update(update),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(peer = %peer, lagged_by = n, "gateway client lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    Some(Ok(Message::Text(text))) => self.handle_request(text.as_str()),
                    _ => continue,
                },
            };
            if ws_tx.send(Message::Text(encode(&outgoing)?.into())).await.is_err() {
                break;
            }
        }

        debug!(peer = %peer, "gateway client disconnected");
        Ok(())
    }

    /// Answer one client text frame.
    pub fn handle_request(&self, text: &str) -> GatewayReply {
        let request = match serde_json::from_str::<GatewayRequest>(text) {
            Ok(request) => request,
            Err(e) => {
                return GatewayReply::Error {
                    message: format!("bad request: {e}"),
                };
            }
        };

        let result = match request {
            GatewayRequest::Get { name } => self.registry.resolve(&name).map(|pv| GatewayReply::Value {
                name: pv,
                value: self.registry.value(pv),
            }),
            GatewayRequest::Put { name, value } => {
                self.registry.put(&name, value).map(|pv| GatewayReply::Ack { name: pv })
            }
            GatewayRequest::List => Ok(GatewayReply::Snapshot {
                variables: self.registry.snapshot(),
            }),
        };
        result.unwrap_or_else(|e| GatewayReply::Error { message: e.to_string() })
    }
}

fn encode(reply: &GatewayReply) -> Result<String, AdrError> {
    serde_json::to_string(reply).map_err(|e| AdrError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use adr_types::WriteOrigin;
    use tokio_tungstenite::connect_async;

    fn make_gateway() -> (Arc<VariableRegistry>, OperatorGateway) {
        let registry = Arc::new(VariableRegistry::default());
        let gateway = OperatorGateway::new(Arc::clone(&registry));
        (registry, gateway)
    }

    fn to_json(reply: &GatewayReply) -> serde_json::Value {
        serde_json::to_value(reply).unwrap()
    }

    #[test]
    fn get_returns_current_value() {
        let (registry, gateway) = make_gateway();
        registry.write(PvName::Temp, Value::Float(0.12), WriteOrigin::Device).unwrap();

        let reply = to_json(&gateway.handle_request(r#"{"op":"get","name":"TEMP"}"#));

        assert_eq!(reply["op"], "value");
        assert_eq!(reply["name"], "TEMP");
        assert_eq!(reply["value"], 0.12);
    }

    #[test]
    fn put_writes_through_the_operator_path() {
        let (registry, gateway) = make_gateway();

        let reply = to_json(&gateway.handle_request(r#"{"op":"put","name":"TEMP_SP","value":0.075}"#));

        assert_eq!(reply["op"], "ack");
        assert_eq!(reply["name"], "TEMP_SP");
        assert_eq!(registry.value(PvName::TempSp), Value::Float(0.075));
    }

    #[test]
    fn put_to_read_only_variable_is_an_error_reply() {
        let (registry, gateway) = make_gateway();

        let reply = to_json(&gateway.handle_request(r#"{"op":"put","name":"STATE","value":"Idle"}"#));

        assert_eq!(reply["op"], "error");
        assert!(reply["message"].as_str().unwrap().contains("read-only"));
        assert_eq!(registry.write_count(PvName::State), 0);
    }

    #[test]
    fn malformed_request_is_an_error_reply() {
        let (_, gateway) = make_gateway();
        let reply = to_json(&gateway.handle_request("{\"op\":\"launch\"}"));
        assert_eq!(reply["op"], "error");
        let reply = to_json(&gateway.handle_request("not json"));
        assert_eq!(reply["op"], "error");
    }

    #[test]
    fn list_returns_every_variable() {
        let (_, gateway) = make_gateway();
        let reply = to_json(&gateway.handle_request(r#"{"op":"list"}"#));
        assert_eq!(reply["op"], "snapshot");
        assert_eq!(reply["variables"].as_array().unwrap().len(), PvName::ALL.len());
    }

    #[tokio::test]
    async fn websocket_client_gets_snapshot_then_updates() {
        let (registry, gateway) = make_gateway();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let server = tokio::spawn(gateway.serve(listener, shutdown));

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();

        let first = ws.next().await.unwrap().unwrap();
        let snapshot: serde_json::Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(snapshot["op"], "snapshot");

        ws.send(Message::Text(r#"{"op":"put","name":"PAUSE","value":1}"#.into()))
            .await
            .unwrap();

        // The update broadcast and the ack may arrive in either order.
        let mut ops = Vec::new();
        for _ in 0..2 {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let json: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
            ops.push(json["op"].as_str().unwrap().to_string());
        }
        ops.sort();
        assert_eq!(ops, vec!["ack".to_string(), "update".to_string()]);
        assert_eq!(registry.value(PvName::Pause), Value::Int(1));

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }
}

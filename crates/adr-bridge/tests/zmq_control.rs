//! End-to-end check of the ZeroMQ command path against a local `REP` socket.

use std::time::Duration;

use adr_bridge::{ControlChannel, ZmqControlChannel};
use adr_types::DeviceCommand;
use zeromq::{RepSocket, Socket, SocketRecv};

#[tokio::test]
async fn control_channel_delivers_request_json() {
    let mut device = RepSocket::new();
    let endpoint = device.bind("tcp://127.0.0.1:0").await.unwrap().to_string();

    let channel = ZmqControlChannel::new(endpoint);
    let payload = DeviceCommand::SetTempSetpoint(0.075).to_request().to_json().unwrap();
    channel.send(payload).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), device.recv())
        .await
        .expect("device received nothing")
        .unwrap();
    let frame = message.get(0).unwrap();
    let json: serde_json::Value = serde_json::from_slice(frame).unwrap();

    assert_eq!(
        json,
        serde_json::json!({"method": "set_temp_sp_k", "params": [0.075], "kwargs": {}})
    );
}

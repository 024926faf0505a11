//! A scripted device end for driving a `Client` over an in-memory stream.

use crate::{
    async_client::{Client, Config, DEFAULT_RECEIVER_ID, DEFAULT_SENDER_ID, app},
    codec::CastMessageCodec,
    message::{CastMessage, CastMessagePayload},
    payload,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::{sync::Once, time::Duration};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;

const DUPLEX_BUFFER_LEN: usize = 256 * 1024;

pub(crate) struct FakeDevice {
    framed: Framed<DuplexStream, CastMessageCodec>,
}

impl FakeDevice {
    /// Next message from the client with its JSON body. Panics on EOF.
    pub(crate) async fn recv_json(&mut self) -> (CastMessage, serde_json::Value) {
        self.try_recv().await.expect("client stream ended")
    }

    /// Next message from the client, `None` once the client end is gone.
    pub(crate) async fn try_recv(&mut self) -> Option<(CastMessage, serde_json::Value)> {
        let msg = match self.framed.next().await? {
            Ok(msg) => msg,
            Err(_) => return None,
        };
        let body = match msg.payload.as_str() {
            Some(s) => serde_json::from_str(s).expect("client sent invalid json"),
            None => serde_json::Value::Null,
        };
        Some((msg, body))
    }

    /// Next message, which must be `typ` on `namespace`. Heartbeats are
    /// skipped unless `namespace` is the heartbeat namespace.
    pub(crate) async fn expect(&mut self, namespace: &str, typ: &str)
    -> (CastMessage, serde_json::Value)
    {
        loop {
            let (msg, body) = self.recv_json().await;
            if msg.namespace == payload::heartbeat::CHANNEL_NAMESPACE
                && namespace != payload::heartbeat::CHANNEL_NAMESPACE
            {
                continue;
            }
            assert_eq!(msg.namespace, namespace, "unexpected message {body}");
            assert_eq!(body["type"], typ, "unexpected message {body}");
            return (msg, body);
        }
    }

    /// Answer `req` with `body`, echoing its requestId.
    pub(crate) async fn reply(&mut self, req: &CastMessage, req_body: &serde_json::Value,
                              mut body: serde_json::Value)
    {
        body["requestId"] = req_body["requestId"].clone();
        self.send_json(&req.namespace, &req.destination, &req.source, body).await;
    }

    pub(crate) async fn send_json(&mut self, namespace: &str, source: &str, destination: &str,
                                  body: serde_json::Value)
    {
        self.send(CastMessage {
            namespace: namespace.to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
            payload: CastMessagePayload::String(body.to_string()),
        }).await;
    }

    /// Send `payload` verbatim from the platform receiver.
    pub(crate) async fn send_raw_payload(&mut self, namespace: &str, payload: &str) {
        self.send(CastMessage {
            namespace: namespace.to_string(),
            source: DEFAULT_RECEIVER_ID.to_string(),
            destination: DEFAULT_SENDER_ID.to_string(),
            payload: CastMessagePayload::String(payload.to_string()),
        }).await;
    }

    /// Write bytes below the framing layer.
    pub(crate) async fn write_bytes(&mut self, bytes: &[u8]) {
        let stream = self.framed.get_mut();
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn send(&mut self, msg: CastMessage) {
        self.framed.send(msg).await.unwrap();
    }
}

pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config with heartbeats far enough apart to stay out of a test's way.
pub(crate) fn test_config() -> Config {
    Config::new(([127, 0, 0, 1], 8009).into())
        .with_heartbeat_interval(Duration::from_secs(3600))
}

/// A started client and the device end, with the client's CONNECT unread.
pub(crate) async fn connect_pair(config: Config) -> (Client, FakeDevice) {
    init_tracing();

    let (client_end, device_end) = tokio::io::duplex(DUPLEX_BUFFER_LEN);
    let device = FakeDevice {
        framed: Framed::new(device_end, CastMessageCodec::new(config.max_frame_len)),
    };
    let client = Client::from_stream(client_end, config).await.unwrap();
    (client, device)
}

/// Like `connect_pair`, with the CONNECT to the platform receiver consumed.
pub(crate) async fn connected(config: Config) -> (Client, FakeDevice) {
    let (client, mut device) = connect_pair(config).await;
    let (msg, _body) = device.expect(payload::connection::CHANNEL_NAMESPACE, "CONNECT").await;
    assert_eq!(msg.destination, DEFAULT_RECEIVER_ID);
    (client, device)
}

/// RECEIVER_STATUS body listing the default media receiver as running.
pub(crate) fn media_app_status(session_id: &str, transport_id: &str) -> serde_json::Value {
    json!({
        "type": "RECEIVER_STATUS",
        "status": {
            "applications": [{
                "appId": app::DEFAULT_MEDIA_RECEIVER,
                "displayName": "Default Media Receiver",
                "isIdleScreen": false,
                "namespaces": [
                    { "name": payload::connection::CHANNEL_NAMESPACE },
                    { "name": payload::media::CHANNEL_NAMESPACE }
                ],
                "sessionId": session_id,
                "statusText": "Ready To Cast",
                "transportId": transport_id
            }],
            "isActiveInput": true,
            "isStandBy": false,
            "volume": { "level": 0.5, "muted": false }
        }
    })
}

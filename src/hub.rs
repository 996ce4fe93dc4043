//! IoT hub connection.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use paho_mqtt::async_client::AsyncClient as MqttClient;
use paho_mqtt::{
    ConnectOptionsBuilder, CreateOptionsBuilder, MessageBuilder as MqttMessageBuilder,
    SslOptionsBuilder,
};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};

use crate::config::DeviceConfig;
use crate::token;
use crate::twin::{PropertyMap, TwinProperties};

const API_VERSION: &str = "2021-04-12";
const TOKEN_TTL: Duration = Duration::from_secs(3600);
const STREAM_CAPACITY: usize = 64;

const TWIN_GET_TOPIC: &str = "$iothub/twin/GET/";
const TWIN_PATCH_REPORTED_TOPIC: &str = "$iothub/twin/PATCH/properties/reported/";
const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";

fn telemetry_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/events/")
}

fn devicebound_filter(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

/// The contract every menu operation consumes. [`IotHubClient`] is the live
/// implementation; tests substitute a scripted one.
#[async_trait]
pub trait HubConnection {
    /// Transmit one device-to-cloud event payload.
    async fn send_event(&mut self, payload: Vec<u8>) -> Result<(), Error>;

    /// Fetch the current twin document. Never cached.
    async fn fetch_twin(&mut self) -> Result<TwinProperties, Error>;

    /// Submit `patch` as the device's reported properties.
    async fn update_reported(&mut self, patch: PropertyMap) -> Result<(), Error>;

    /// Hand over the cloud-to-device delivery channel. Yields `Some` exactly
    /// once per session; afterwards the channel is owned by whoever took it.
    fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<InboundMessage>>;
}

/// A cloud-to-device message: the lossy-UTF-8 text of the transport bytes,
/// plus the `value` field when the text parses as JSON.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub text: String,
    pub value: Option<String>,
}

#[derive(Deserialize)]
struct InboundBody {
    value: String,
}

impl InboundMessage {
    pub fn from_payload(payload: &[u8]) -> InboundMessage {
        let text = String::from_utf8_lossy(payload).into_owned();
        // best effort; anything that is not {"value": …} just logs as text
        let value = serde_json::from_str::<InboundBody>(&text)
            .ok()
            .map(|body| body.value);
        InboundMessage { text, value }
    }
}

struct TwinResponse {
    status: u16,
    body: Vec<u8>,
}

type PendingRequests = Arc<Mutex<HashMap<String, oneshot::Sender<TwinResponse>>>>;

/// The single live connection to the hub for one device identity.
///
/// A background router task owns the MQTT message stream: twin responses are
/// matched to their waiting request by request id, cloud-to-device messages
/// are forwarded into the inbound channel.
pub struct IotHubClient {
    client: MqttClient,
    device_id: String,
    pending: PendingRequests,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Option<mpsc::UnboundedReceiver<InboundMessage>>,
}

impl IotHubClient {
    pub fn new(config: &DeviceConfig) -> Result<IotHubClient, Error> {
        let client = MqttClient::new(
            CreateOptionsBuilder::new()
                .server_uri(format!("ssl://{}:8883", config.hostname))
                .client_id(config.device_id.as_str())
                .finalize(),
        )?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Ok(IotHubClient {
            client,
            device_id: config.device_id.clone(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
        })
    }

    /// Connect to the hub, subscribe to the twin-response and
    /// cloud-to-device topics, and start the delivery router.
    ///
    /// You must call this method before any operation.
    #[tracing::instrument(skip(config), err)]
    pub async fn connect(&mut self, config: &DeviceConfig) -> Result<(), Error> {
        let password = token::generate(
            &config.hostname,
            &config.device_id,
            &config.shared_access_key,
            TOKEN_TTL,
        )?;

        let connect_options = ConnectOptionsBuilder::new()
            .user_name(format!(
                "{}/{}/?api-version={API_VERSION}",
                config.hostname, config.device_id,
            ))
            .password(password)
            .ssl_options(SslOptionsBuilder::new().finalize())
            .keep_alive_interval(Duration::from_secs(30))
            .clean_session(true)
            .finalize();

        // the stream must exist before the broker can deliver anything
        let stream = self.client.get_stream(STREAM_CAPACITY);

        tracing::info!("connecting to the IoT hub");
        let connection_info = self.client.connect(connect_options).await;
        if let Err(e) = connection_info {
            tracing::error!(error = ?e, "failed to connect to the IoT hub");
            return Err(e.into());
        }

        self.client.subscribe(TWIN_RESPONSE_FILTER, 1).await?;
        self.client
            .subscribe(devicebound_filter(&self.device_id), 1)
            .await?;

        let pending = self.pending.clone();
        let inbound_tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            while let Ok(event) = stream.recv().await {
                let Some(message) = event else {
                    tracing::warn!("hub connection lost");
                    // fail the waiting twin requests instead of hanging them
                    pending
                        .lock()
                        .expect("pending twin requests lock poisoned")
                        .clear();
                    continue;
                };

                let topic = message.topic().to_string();
                if let Some((status, rid)) = parse_twin_response_topic(&topic) {
                    let waiter = pending
                        .lock()
                        .expect("pending twin requests lock poisoned")
                        .remove(&rid);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(TwinResponse {
                                status,
                                body: message.payload().to_vec(),
                            });
                        }
                        None => {
                            tracing::debug!(topic = %topic, "twin response with no waiting request")
                        }
                    }
                } else if topic.contains("/messages/devicebound") {
                    let _ = inbound_tx.send(InboundMessage::from_payload(message.payload()));
                } else {
                    tracing::debug!(topic = %topic, "delivery on an unexpected topic");
                }
            }
        });

        tracing::info!("connected to the IoT hub");
        Ok(())
    }

    /// Disconnect from the hub. Failures are logged, not propagated; the
    /// process is exiting either way.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect(None).await {
            tracing::warn!(error = ?e, "disconnect from the IoT hub failed");
        }
    }

    /// Publish a twin request and wait for the correlated response.
    async fn twin_request(&mut self, topic: &str, payload: Vec<u8>) -> Result<TwinResponse, Error> {
        let rid = uuid::Uuid::now_v7().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending twin requests lock poisoned")
            .insert(rid.clone(), tx);

        let message = MqttMessageBuilder::new()
            .topic(format!("{topic}?$rid={rid}"))
            .payload(payload)
            .qos(0)
            .finalize();

        if let Err(e) = self.client.publish(message).await {
            self.pending
                .lock()
                .expect("pending twin requests lock poisoned")
                .remove(&rid);
            return Err(e.into());
        }

        let response = rx.await.map_err(|_| Error::ConnectionClosed)?;
        if !(200..300).contains(&response.status) {
            return Err(Error::TwinRequestRejected(response.status));
        }
        Ok(response)
    }
}

#[async_trait]
impl HubConnection for IotHubClient {
    async fn send_event(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        let message = MqttMessageBuilder::new()
            .topic(telemetry_topic(&self.device_id))
            .payload(payload)
            .qos(1)
            .finalize();

        self.client.publish(message).await?;
        Ok(())
    }

    async fn fetch_twin(&mut self) -> Result<TwinProperties, Error> {
        let response = self.twin_request(TWIN_GET_TOPIC, Vec::new()).await?;
        let twin: TwinProperties = serde_json::from_slice(&response.body)?;
        Ok(twin.strip_metadata())
    }

    async fn update_reported(&mut self, patch: PropertyMap) -> Result<(), Error> {
        let body = serde_json::to_vec(&patch)?;
        self.twin_request(TWIN_PATCH_REPORTED_TOPIC, body).await?;
        Ok(())
    }

    fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.inbound_rx.take()
    }
}

impl Debug for IotHubClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("IotHubClient")
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Extract the status code and request id from a twin response topic of the
/// form `$iothub/twin/res/{status}/?$rid={rid}`.
fn parse_twin_response_topic(topic: &str) -> Option<(u16, String)> {
    let rest = topic.strip_prefix(TWIN_RESPONSE_PREFIX)?;
    let (status, query) = rest.split_once("/?")?;
    let status = status.parse().ok()?;
    let rid = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("$rid="))?;
    Some((status, rid.to_string()))
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("mqtt transport: {0}")]
    Transport(#[from] paho_mqtt::Error),

    #[error("generate access token: {0}")]
    Token(#[from] token::Error),

    #[error("decode twin document: {0}")]
    DecodeTwin(#[from] serde_json::Error),

    #[error("twin request rejected with status {0}")]
    TwinRequestRejected(u16),

    #[error("connection closed before the response arrived")]
    ConnectionClosed,
}

//! Device-to-cloud telemetry.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::DeviceConfig;
use crate::hub::HubConnection;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The message this client sends upstream: device id, location label, free
/// text and the wall-clock time the envelope was built. Serialized as a
/// flat JSON object and sent as UTF-8 bytes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEnvelope {
    pub device_id: String,
    pub location: String,
    pub message: String,
    pub timestamp: String,
}

impl TelemetryEnvelope {
    pub fn new<T: Into<String>>(device_id: &str, location: &str, message: T) -> TelemetryEnvelope {
        TelemetryEnvelope {
            device_id: device_id.to_string(),
            location: location.to_string(),
            message: message.into(),
            timestamp: chrono::Local::now().format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

/// Build one envelope around `text` and send it. Transmission failure is
/// logged and swallowed; an interactive session must outlive a lost
/// message.
pub async fn send_once<H: HubConnection>(hub: &mut H, config: &DeviceConfig, text: String) {
    let envelope = TelemetryEnvelope::new(&config.device_id, &config.location, text);

    let payload = match serde_json::to_string(&envelope) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode telemetry envelope");
            return;
        }
    };

    tracing::info!(payload = %payload, "sending message");

    if let Err(e) = hub.send_event(payload.into_bytes()).await {
        tracing::error!(error = %e, "failed to send message");
    }
}

/// Send `count` envelopes carrying random message text, sleeping
/// `interval_ms` after every send, the last one included. A failed send is
/// logged by [`send_once`] and does not stop the burst.
pub async fn send_burst<H: HubConnection>(
    hub: &mut H,
    config: &DeviceConfig,
    count: u32,
    interval_ms: u64,
) {
    for _ in 0..count {
        let roll = rand::thread_rng().gen_range(0..count);
        send_once(hub, config, format!("Random message {roll}")).await;
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }
}

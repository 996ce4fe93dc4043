//! Device connection settings.

use std::env;

/// Environment variable holding the device connection string.
pub const CONNECTION_STRING_VAR: &str = "IOT_CONSOLE_CONNECTION_STRING";

/// Environment variable overriding the telemetry location label.
pub const LOCATION_VAR: &str = "IOT_CONSOLE_LOCATION";

const DEFAULT_LOCATION: &str = "West Europe";

/// Settings for one device identity on the hub.
///
/// `hostname`, `device_id` and `shared_access_key` come from the
/// `HostName=…;DeviceId=…;SharedAccessKey=…` connection string. `location`
/// is a display label stamped into telemetry payloads; it plays no part in
/// authentication.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub hostname: String,
    pub device_id: String,
    pub shared_access_key: String,
    pub location: String,
}

impl DeviceConfig {
    /// Parse an Azure-style device connection string.
    pub fn from_connection_string(connection_string: &str) -> Result<DeviceConfig, Error> {
        let mut hostname = None;
        let mut device_id = None;
        let mut shared_access_key = None;

        for segment in connection_string.split(';').filter(|s| !s.trim().is_empty()) {
            // split at the first '='; shared access keys are base64 and may
            // themselves end in '='
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| Error::MalformedSegment(segment.to_string()))?;

            match key.trim() {
                "HostName" => hostname = Some(value.to_string()),
                "DeviceId" => device_id = Some(value.to_string()),
                "SharedAccessKey" => shared_access_key = Some(value.to_string()),
                other => tracing::debug!(key = other, "ignoring connection string segment"),
            }
        }

        Ok(DeviceConfig {
            hostname: hostname.ok_or(Error::MissingField("HostName"))?,
            device_id: device_id.ok_or(Error::MissingField("DeviceId"))?,
            shared_access_key: shared_access_key.ok_or(Error::MissingField("SharedAccessKey"))?,
            location: env::var(LOCATION_VAR).unwrap_or_else(|_| DEFAULT_LOCATION.to_string()),
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("connection string segment without '=': {0}")]
    MalformedSegment(String),

    #[error("connection string is missing {0}")]
    MissingField(&'static str),
}

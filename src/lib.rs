//! # IoT Device Console
//!
//! An interactive console client for an IoT hub. It sends JSON-wrapped
//! telemetry envelopes ([`telemetry::TelemetryEnvelope`]) device-to-cloud,
//! views and updates the device twin ([`twin::TwinProperties`]), and logs
//! cloud-to-device messages delivered over the [`hub`] connection.

pub mod config;
pub mod console;
pub mod hub;
pub mod telemetry;
pub mod token;
pub mod twin;

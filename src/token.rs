//! Shared-access-signature tokens for hub authentication.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Generate a SAS token valid for `ttl` from now, suitable as the MQTT
/// password for the device.
pub fn generate(
    hostname: &str,
    device_id: &str,
    shared_access_key: &str,
    ttl: Duration,
) -> Result<String, Error> {
    let expiry = chrono::Utc::now().timestamp() + ttl.as_secs() as i64;
    sign_with_expiry(hostname, device_id, shared_access_key, expiry)
}

fn sign_with_expiry(
    hostname: &str,
    device_id: &str,
    shared_access_key: &str,
    expiry: i64,
) -> Result<String, Error> {
    let resource_uri = urlencoding::encode(&format!("{hostname}/devices/{device_id}")).into_owned();
    let string_to_sign = format!("{resource_uri}\n{expiry}");

    let key = STANDARD.decode(shared_access_key)?;
    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| Error::KeyRejected)?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "SharedAccessSignature sr={resource_uri}&sig={}&se={expiry}",
        urlencoding::encode(&signature),
    ))
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("decode shared access key: {0}")]
    DecodeKey(#[from] base64::DecodeError),

    #[error("shared access key rejected by the signer")]
    KeyRejected,
}

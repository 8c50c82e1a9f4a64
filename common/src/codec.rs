use core::fmt::Write as _;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::types::{Reading, UpdatePayload};

pub const MAX_FILENAME_BYTES: usize = 64;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not valid utf-8")]
    NotUtf8,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("upload is not base64 data")]
    UploadNotBase64,
    #[error("invalid base64 upload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid filename `{name}`: {reason}")]
    InvalidFilename { name: String, reason: &'static str },
    #[error("update is {size} bytes, device limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("sha256 must be 64 hex characters")]
    InvalidDigest,
    #[error("sha256 mismatch (expected {expected}, got {actual})")]
    DigestMismatch { expected: String, actual: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct SensorMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    #[serde(rename = "DHT11_Temperature", default)]
    dht11_temperature: f64,
    #[serde(rename = "DHT11_Humidity", default)]
    dht11_humidity: f64,
    #[serde(rename = "DS18B20_Temperature", default)]
    ds18b20_temperature: f64,
    #[serde(rename = "Light_Intensity", default)]
    light_intensity: f64,
}

pub fn encode_update(payload: &UpdatePayload) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(payload)?)
}

pub fn decode_update(raw: &[u8]) -> Result<UpdatePayload, CodecError> {
    let text = std::str::from_utf8(raw).map_err(|_| CodecError::NotUtf8)?;
    Ok(serde_json::from_str(text)?)
}

pub fn encode_reading(reading: &Reading) -> Result<Vec<u8>, CodecError> {
    let message = SensorMessage {
        time: Some(reading.timestamp.clone()),
        dht11_temperature: reading.temp_dht11,
        dht11_humidity: reading.hum_dht11,
        ds18b20_temperature: reading.temp_ds18b20,
        light_intensity: reading.light_intensity,
    };
    Ok(serde_json::to_vec(&message)?)
}

/// Decodes a sensor message. `fallback_timestamp` is used when the
/// sender left out `time`.
pub fn decode_reading(raw: &[u8], fallback_timestamp: &str) -> Result<Reading, CodecError> {
    let text = std::str::from_utf8(raw).map_err(|_| CodecError::NotUtf8)?;
    let message: SensorMessage = serde_json::from_str(text)?;
    Ok(Reading {
        timestamp: message
            .time
            .unwrap_or_else(|| fallback_timestamp.to_string()),
        temp_dht11: message.dht11_temperature,
        hum_dht11: message.dht11_humidity,
        temp_ds18b20: message.ds18b20_temperature,
        light_intensity: message.light_intensity,
    })
}

/// Turns an uploaded file (plain base64 or a `data:<mime>;base64,` URL)
/// into source text.
pub fn decode_upload(contents: &str) -> Result<String, CodecError> {
    let contents = contents.trim();
    let encoded = match contents.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest.split_once(',').ok_or(CodecError::UploadNotBase64)?;
            if !header.ends_with(";base64") {
                return Err(CodecError::UploadNotBase64);
            }
            data
        }
        None => contents,
    };

    let bytes = STANDARD.decode(encoded.trim())?;
    String::from_utf8(bytes).map_err(|_| CodecError::NotUtf8)
}

pub fn sha256_hex(code: &str) -> String {
    let digest = Sha256::digest(code.as_bytes());
    let mut digest_hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(&mut digest_hex, "{byte:02x}");
    }
    digest_hex
}

impl UpdatePayload {
    /// Checks `sha256` against `code`. Payloads without a digest pass.
    pub fn verify_digest(&self) -> Result<(), CodecError> {
        let Some(expected) = self.sha256.as_deref() else {
            return Ok(());
        };

        let expected = expected.trim();
        if expected.len() != 64 || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CodecError::InvalidDigest);
        }

        let expected = expected.to_ascii_lowercase();
        let actual = sha256_hex(&self.code);
        if actual != expected {
            return Err(CodecError::DigestMismatch { expected, actual });
        }
        Ok(())
    }
}

/// Validates a filename taken from the network before it is used as a
/// storage path. Only a bare file name inside the script directory is
/// accepted.
pub fn sanitize_filename(name: &str) -> Result<String, CodecError> {
    let trimmed = name.trim();
    let reject = |reason| {
        Err(CodecError::InvalidFilename {
            name: filename_preview(name),
            reason,
        })
    };

    if trimmed.is_empty() {
        return reject("empty");
    }
    if trimmed.len() > MAX_FILENAME_BYTES {
        return reject("longer than 64 bytes");
    }
    if trimmed.contains(['/', '\\', ':']) {
        return reject("path separators are not allowed");
    }
    if trimmed.starts_with('.') {
        return reject("leading dot is not allowed");
    }
    if trimmed.chars().any(char::is_control) {
        return reject("control characters are not allowed");
    }

    Ok(trimmed.to_string())
}

/// Bounded copy of an untrusted name for error messages.
fn filename_preview(name: &str) -> String {
    let mut preview: String = name.chars().take(MAX_FILENAME_BYTES).collect();
    if preview.len() < name.len() {
        preview.push_str("...");
    }
    preview
}

use std::time::Duration;

use anyhow::{anyhow, Context};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Outgoing, QoS, Transport};
use serde::{Deserialize, Serialize};

use remoteiot_common::{
    codec::{decode_upload, encode_update, sanitize_filename},
    BrokerConfig, CodecError, UpdatePayload,
};

/// File picked in the panel, as the browser hands it over.
#[derive(Debug, Deserialize)]
pub struct CodeUpload {
    pub filename: String,
    /// Base64 body or a `data:<mime>;base64,` URL.
    pub contents: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OtaSendStatus {
    #[serde(rename = "inProgress")]
    pub in_progress: bool,
    #[serde(rename = "sentCount")]
    pub sent_count: u64,
    #[serde(rename = "lastFilename")]
    pub last_filename: Option<String>,
    #[serde(rename = "lastSha256")]
    pub last_sha256: Option<String>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(rename = "lastCompletedEpoch")]
    pub last_completed_epoch: Option<i64>,
}

/// Builds the wire payload for an upload. `max_bytes` is the device's
/// update limit; anything larger would never be applied.
pub fn build_update(upload: &CodeUpload, max_bytes: usize) -> Result<UpdatePayload, CodecError> {
    let filename = sanitize_filename(&upload.filename)?;
    let code = decode_upload(&upload.contents)?;
    let payload = UpdatePayload::with_digest(filename, code);

    let size = encode_update(&payload)?.len();
    if size > max_bytes {
        return Err(CodecError::PayloadTooLarge {
            size,
            limit: max_bytes,
        });
    }
    Ok(payload)
}

pub fn mqtt_options(broker: &BrokerConfig, client_id: impl Into<String>) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
    options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
    if !broker.user.is_empty() {
        options.set_credentials(broker.user.clone(), broker.pass.clone());
    }
    if broker.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// Publishes `payload` once over a dedicated connection: connect, publish,
/// wait for the broker's PUBACK, disconnect. The device never acknowledges.
pub async fn send_update(
    broker: &BrokerConfig,
    client_id: &str,
    topic: &str,
    payload: &UpdatePayload,
    timeout: Duration,
) -> anyhow::Result<()> {
    let body = encode_update(payload).context("failed to encode update payload")?;

    let session_id = format!("{client_id}-ota-{}", chrono::Utc::now().timestamp_millis());
    let mut options = mqtt_options(broker, session_id);
    options.set_clean_session(true);
    let max_packet = body.len() + 1024;
    options.set_max_packet_size(max_packet, max_packet);

    let (client, mut eventloop) = AsyncClient::new(options, 4);
    client
        .publish(topic, QoS::AtLeastOnce, false, body)
        .await
        .context("failed to queue update publish")?;

    let exchange = async {
        loop {
            let event = eventloop.poll().await.with_context(|| {
                format!("mqtt connection to {}:{} failed", broker.host, broker.port)
            })?;
            if let Event::Incoming(Incoming::PubAck(_)) = event {
                break;
            }
        }

        client
            .disconnect()
            .await
            .context("failed to queue disconnect")?;
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        anyhow::Ok(())
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| {
            anyhow!(
                "timed out after {} ms waiting for the broker",
                timeout.as_millis()
            )
        })?
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    use super::*;

    const DEVICE_LIMIT: usize = 64 * 1024;

    fn local_broker(port: u16) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..BrokerConfig::default()
        }
    }

    fn blink_update() -> UpdatePayload {
        UpdatePayload::with_digest("user_blink.py", "print(1)\n")
    }

    #[test]
    fn builds_update_from_data_url() {
        let upload = CodeUpload {
            filename: "user_blink.py".to_string(),
            contents: "data:text/x-python;base64,cHJpbnQoMSkK".to_string(),
        };

        let payload = build_update(&upload, DEVICE_LIMIT).unwrap();

        assert_eq!(payload.filename, "user_blink.py");
        assert_eq!(payload.code, "print(1)\n");
        assert!(payload.verify_digest().is_ok());
    }

    #[test]
    fn rejects_traversal_in_upload_name() {
        let upload = CodeUpload {
            filename: "../../boot.py".to_string(),
            contents: "cHJpbnQoMSkK".to_string(),
        };

        assert!(matches!(
            build_update(&upload, DEVICE_LIMIT),
            Err(CodecError::InvalidFilename { .. })
        ));
    }

    #[test]
    fn rejects_binary_upload() {
        let upload = CodeUpload {
            filename: "user_a.py".to_string(),
            // 0xff 0xfe 0xfd
            contents: "//79".to_string(),
        };

        assert!(matches!(build_update(&upload, DEVICE_LIMIT), Err(CodecError::NotUtf8)));
    }

    #[test]
    fn rejects_upload_over_device_limit() {
        // 200 copies of `print(1)\n`, 1800 bytes of source.
        let upload = CodeUpload {
            filename: "user_big.py".to_string(),
            contents: "cHJpbnQoMSkK".repeat(200),
        };

        let err = build_update(&upload, 1_024).unwrap_err();

        assert!(matches!(err, CodecError::PayloadTooLarge { limit: 1_024, .. }));
        assert!(build_update(&upload, DEVICE_LIMIT).is_ok());
    }

    #[test]
    fn tls_flag_selects_tls_transport() {
        let mut broker = local_broker(8883);
        assert!(matches!(
            mqtt_options(&broker, "panel").transport(),
            Transport::Tcp
        ));

        broker.tls = true;
        assert!(matches!(
            mqtt_options(&broker, "panel").transport(),
            Transport::Tls(_)
        ));
    }

    #[tokio::test]
    async fn send_reports_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = send_update(
            &local_broker(port),
            "panel-test",
            "fyp/code_update",
            &blink_update(),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        let message = format!("{err:#}");
        assert!(
            message.starts_with(&format!("mqtt connection to 127.0.0.1:{port} failed")),
            "{message}"
        );
    }

    #[tokio::test]
    async fn send_gives_up_on_silent_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept the connection and never answer CONNECT.
        let silent = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let err = send_update(
            &local_broker(port),
            "panel-test",
            "fyp/code_update",
            &blink_update(),
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "timed out after 300 ms waiting for the broker");
        silent.abort();
    }
}

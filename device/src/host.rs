use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, Transport};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use remoteiot_common::{
    codec::encode_reading, types::TIMESTAMP_FORMAT, DeviceHost, OtaAgent, RuntimeConfig,
    ScriptError, ScriptStorage,
};

use crate::{
    retry::{FixedRetry, RetryStep},
    sensors::SimulatedSensors,
};

const UPDATE_QUEUE_DEPTH: usize = 4;

/// Script capabilities backed by the MQTT client. Pins are tracked in
/// memory on host builds.
struct MqttDeviceHost {
    mqtt: AsyncClient,
    debug_topic: String,
    pins: BTreeMap<u8, bool>,
}

impl MqttDeviceHost {
    fn new(mqtt: AsyncClient, debug_topic: String) -> Self {
        Self {
            mqtt,
            debug_topic,
            pins: BTreeMap::new(),
        }
    }
}

impl DeviceHost for MqttDeviceHost {
    fn print(&mut self, line: &str) {
        info!(target: "device_script", "{line}");
    }

    fn publish_debug(&mut self, text: &str) {
        info!("debug: {text}");
        if let Err(err) = self.mqtt.try_publish(
            self.debug_topic.as_str(),
            QoS::AtLeastOnce,
            false,
            text.as_bytes().to_vec(),
        ) {
            warn!("failed to publish debug message: {err}");
        }
    }

    fn set_pin(&mut self, pin: u8, high: bool) -> Result<(), ScriptError> {
        let previous = self.pins.insert(pin, high);
        info!(
            "pin {pin}: {} -> {}",
            level_name(previous),
            level_name(Some(high))
        );
        Ok(())
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

fn level_name(level: Option<bool>) -> &'static str {
    match level {
        Some(true) => "high",
        Some(false) => "low",
        None => "unset",
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("REMOTEIOT_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.remoteiot"));

    let mut runtime = load_runtime_config(&data_dir.join("runtime.json"))
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load runtime config: {err:#}");
            RuntimeConfig::default()
        });
    runtime.apply_env(|key| std::env::var(key).ok());
    runtime.sanitize();

    let storage = ScriptStorage::new(data_dir.join(&runtime.device.script_dir));
    info!("storing scripts under {}", storage.root().display());
    let agent = OtaAgent::new(storage, &runtime.device);

    let mut mqtt_options = MqttOptions::new(
        runtime.device.client_id.clone(),
        runtime.broker.host.clone(),
        runtime.broker.port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(runtime.broker.keep_alive_secs));
    mqtt_options.set_clean_session(true);
    // Updates above max_payload_bytes must still decode so the agent can
    // report them as too large.
    mqtt_options.set_max_packet_size(
        runtime.device.max_packet_bytes,
        runtime.device.max_packet_bytes,
    );
    if !runtime.broker.user.is_empty() {
        mqtt_options.set_credentials(runtime.broker.user.clone(), runtime.broker.pass.clone());
    }
    if runtime.broker.tls {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 32);
    let (update_tx, mut update_rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);
    let (connected_tx, mut connected_rx) = watch::channel(false);

    let retry = FixedRetry::new(
        runtime.device.reconnect_attempts,
        Duration::from_millis(runtime.device.reconnect_delay_ms),
        Duration::from_millis(runtime.device.low_power_pause_ms),
    );
    spawn_mqtt_loop(
        mqtt.clone(),
        eventloop,
        runtime.topics.code_update.clone(),
        retry,
        update_tx,
        connected_tx,
    );

    connected_rx
        .wait_for(|connected| *connected)
        .await
        .context("mqtt loop stopped before connecting")?;
    info!(
        "connected to {}:{}, subscribed to {}",
        runtime.broker.host, runtime.broker.port, runtime.topics.code_update
    );

    let mut host = MqttDeviceHost::new(mqtt.clone(), runtime.topics.debug.clone());

    info!("looking for a saved user script");
    match tokio::task::block_in_place(|| agent.run_saved_script(&mut host)) {
        Ok(Some(filename)) => info!("ran saved script {filename}"),
        Ok(None) => info!("no saved user script"),
        Err(err) => warn!("saved script failed: {err}"),
    }

    let mut sensors = SimulatedSensors::new();
    loop {
        check_updates(&agent, &mut host, &mut update_rx);

        let reading = sensors.read(local_timestamp());
        match encode_reading(&reading) {
            Ok(body) => {
                if let Err(err) = mqtt.try_publish(
                    runtime.topics.sensor.as_str(),
                    QoS::AtLeastOnce,
                    false,
                    body,
                ) {
                    warn!("failed to publish sensor reading: {err}");
                } else {
                    info!(
                        "published reading at {}: {:.1}C {:.0}% {:.1}C light {:.0}",
                        reading.timestamp,
                        reading.temp_dht11,
                        reading.hum_dht11,
                        reading.temp_ds18b20,
                        reading.light_intensity
                    );
                }
            }
            Err(err) => warn!("sensor reading serialization failed: {err}"),
        }

        for _ in 0..runtime.device.publish_interval_secs {
            check_updates(&agent, &mut host, &mut update_rx);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

fn spawn_mqtt_loop(
    mqtt: AsyncClient,
    mut eventloop: EventLoop,
    code_topic: String,
    mut retry: FixedRetry,
    updates: mpsc::Sender<Vec<u8>>,
    connected: watch::Sender<bool>,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    retry.on_success();
                    info!("mqtt connected");
                    if let Err(err) = mqtt.try_subscribe(code_topic.as_str(), QoS::AtLeastOnce) {
                        warn!("failed to subscribe to {code_topic}: {err}");
                    }
                    connected.send_replace(true);
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if message.topic != code_topic {
                        continue;
                    }
                    info!(
                        "OTA message received on {} ({} bytes)",
                        message.topic,
                        message.payload.len()
                    );
                    if let Err(err) = updates.try_send(message.payload.to_vec()) {
                        warn!("dropping code update: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    connected.send_replace(false);
                    match retry.on_failure() {
                        RetryStep::Retry { attempt, delay } => {
                            warn!(
                                "mqtt connection error ({attempt}/{}): {err}",
                                retry.attempts()
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryStep::Pause(pause) => {
                            warn!(
                                "mqtt failed after {} attempts ({err}); pausing for {} ms",
                                retry.attempts(),
                                pause.as_millis()
                            );
                            tokio::time::sleep(pause).await;
                        }
                    }
                }
            }
        }
    });
}

/// Drains queued updates. Script execution blocks the loop until it ends.
fn check_updates(
    agent: &OtaAgent,
    host: &mut MqttDeviceHost,
    updates: &mut mpsc::Receiver<Vec<u8>>,
) {
    while let Ok(raw) = updates.try_recv() {
        match tokio::task::block_in_place(|| agent.handle_update(&raw, host)) {
            Ok(report) => info!(
                "applied {} ({} commands) from {}",
                report.filename,
                report.commands_run,
                report.path.display()
            ),
            Err(err) => warn!("OTA update failed: {err}"),
        }
    }
}

async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid runtime config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn local_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn pin_levels_are_tracked() {
        let (mqtt, _eventloop) =
            AsyncClient::new(MqttOptions::new("device-test", "127.0.0.1", 1883), 4);
        let mut host = MqttDeviceHost::new(mqtt, "fyp/debug_output".to_string());

        host.set_pin(2, true).unwrap();
        host.set_pin(2, false).unwrap();
        host.set_pin(5, true).unwrap();

        assert_eq!(
            host.pins.iter().map(|(pin, high)| (*pin, *high)).collect::<Vec<_>>(),
            vec![(2, false), (5, true)]
        );
        assert_eq!(level_name(None), "unset");
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    script::ScriptLimits,
    topics::{TOPIC_CODE_UPDATE, TOPIC_DEBUG_OUTPUT, TOPIC_SENSOR_READINGS},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub keep_alive_secs: u64,
    /// Connect over TLS using the platform's root certificates.
    pub tls: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            keep_alive_secs: 60,
            tls: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TopicConfig {
    pub sensor: String,
    pub code_update: String,
    pub debug: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            sensor: TOPIC_SENSOR_READINGS.to_string(),
            code_update: TOPIC_CODE_UPDATE.to_string(),
            debug: TOPIC_DEBUG_OUTPUT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub client_id: String,
    /// Relative paths resolve against the data directory.
    pub script_dir: String,
    pub script_prefix: String,
    pub script_suffix: String,
    pub publish_interval_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub low_power_pause_ms: u64,
    pub max_payload_bytes: usize,
    /// Incoming MQTT packet ceiling. Kept well above `max_payload_bytes` so
    /// oversized updates still reach the agent and get reported.
    pub max_packet_bytes: usize,
    pub max_script_sleep_ms: u64,
    pub max_pin: u8,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            client_id: "remoteiot-device".to_string(),
            script_dir: "scripts".to_string(),
            script_prefix: "user".to_string(),
            script_suffix: ".py".to_string(),
            publish_interval_secs: 10,
            reconnect_attempts: 5,
            reconnect_delay_ms: 5_000,
            low_power_pause_ms: 5_000,
            max_payload_bytes: 64 * 1024,
            max_packet_bytes: 1024 * 1024,
            max_script_sleep_ms: 60_000,
            max_pin: 48,
        }
    }
}

impl DeviceConfig {
    pub fn script_limits(&self) -> ScriptLimits {
        ScriptLimits {
            max_sleep: Duration::from_millis(self.max_script_sleep_ms),
            max_pin: self.max_pin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PanelConfig {
    pub client_id: String,
    pub http_port: u16,
    pub reading_capacity: usize,
    pub debug_capacity: usize,
    pub publish_timeout_ms: u64,
    pub timezone: String,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            client_id: "remoteiot-panel".to_string(),
            http_port: 8050,
            reading_capacity: 1_000,
            debug_capacity: 100,
            publish_timeout_ms: 10_000,
            timezone: "UTC".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub device: DeviceConfig,
    pub panel: PanelConfig,
}

impl RuntimeConfig {
    /// Applies `MQTT_*` and `PANEL_HTTP_PORT` overrides. Unparseable
    /// numbers and flags are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
            self.broker.port = port;
        }
        if let Some(user) = lookup("MQTT_USER") {
            self.broker.user = user;
        }
        if let Some(pass) = lookup("MQTT_PASS") {
            self.broker.pass = pass;
        }
        if let Some(tls) = lookup("MQTT_TLS").and_then(|value| parse_flag(&value)) {
            self.broker.tls = tls;
        }
        if let Some(port) = lookup("PANEL_HTTP_PORT").and_then(|value| value.parse::<u16>().ok()) {
            self.panel.http_port = port;
        }
    }

    pub fn sanitize(&mut self) {
        let broker_defaults = BrokerConfig::default();
        if self.broker.host.trim().is_empty() {
            self.broker.host = broker_defaults.host;
        }
        if self.broker.port == 0 {
            self.broker.port = broker_defaults.port;
        }
        self.broker.keep_alive_secs = self.broker.keep_alive_secs.clamp(5, 3_600);

        let topic_defaults = TopicConfig::default();
        if self.topics.sensor.trim().is_empty() {
            self.topics.sensor = topic_defaults.sensor;
        }
        if self.topics.code_update.trim().is_empty() {
            self.topics.code_update = topic_defaults.code_update;
        }
        if self.topics.debug.trim().is_empty() {
            self.topics.debug = topic_defaults.debug;
        }

        let device_defaults = DeviceConfig::default();
        if self.device.client_id.trim().is_empty() {
            self.device.client_id = device_defaults.client_id;
        }
        if self.device.script_dir.trim().is_empty() {
            self.device.script_dir = device_defaults.script_dir;
        }
        self.device.publish_interval_secs = self.device.publish_interval_secs.clamp(1, 3_600);
        self.device.reconnect_attempts = self.device.reconnect_attempts.max(1);
        self.device.max_payload_bytes = self.device.max_payload_bytes.clamp(1_024, 1024 * 1024);
        self.device.max_packet_bytes = self
            .device
            .max_packet_bytes
            .clamp(self.device.max_payload_bytes * 2 + 1_024, 16 * 1024 * 1024);

        let panel_defaults = PanelConfig::default();
        if self.panel.client_id.trim().is_empty() {
            self.panel.client_id = panel_defaults.client_id;
        }
        if self.panel.http_port == 0 {
            self.panel.http_port = panel_defaults.http_port;
        }
        self.panel.reading_capacity = self.panel.reading_capacity.clamp(1, 100_000);
        self.panel.debug_capacity = self.panel.debug_capacity.clamp(1, 10_000);
        self.panel.publish_timeout_ms = self.panel.publish_timeout_ms.max(1_000);
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let runtime: RuntimeConfig =
            serde_json::from_str(r#"{"broker":{"host":"broker.local"},"panel":{"http_port":9000}}"#)
                .unwrap();

        assert_eq!(runtime.broker.host, "broker.local");
        assert_eq!(runtime.broker.port, 1883);
        assert_eq!(runtime.panel.http_port, 9000);
        assert_eq!(runtime.panel.reading_capacity, 1_000);
        assert_eq!(runtime.topics, TopicConfig::default());
    }

    #[test]
    fn env_overrides_broker_settings() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MQTT_HOST", "10.0.0.5"),
            ("MQTT_PORT", "not-a-port"),
            ("MQTT_USER", "panel"),
            ("MQTT_TLS", "true"),
            ("PANEL_HTTP_PORT", "8081"),
        ]);
        let mut runtime = RuntimeConfig::default();

        runtime.apply_env(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(runtime.broker.host, "10.0.0.5");
        assert_eq!(runtime.broker.port, 1883);
        assert_eq!(runtime.broker.user, "panel");
        assert!(runtime.broker.tls);
        assert_eq!(runtime.panel.http_port, 8081);
    }

    #[test]
    fn unknown_tls_flag_keeps_plain_tcp() {
        let mut runtime = RuntimeConfig::default();
        runtime.apply_env(|key| (key == "MQTT_TLS").then(|| "maybe".to_string()));
        assert!(!runtime.broker.tls);
    }

    #[test]
    fn packet_ceiling_leaves_room_above_payload_limit() {
        let mut runtime = RuntimeConfig::default();
        runtime.device.max_payload_bytes = 200 * 1024;
        runtime.device.max_packet_bytes = 1;

        runtime.sanitize();

        assert_eq!(runtime.device.max_packet_bytes, 400 * 1024 + 1_024);
        assert_eq!(DeviceConfig::default().max_packet_bytes, 1024 * 1024);
    }

    #[test]
    fn sanitize_restores_unusable_values() {
        let mut runtime = RuntimeConfig::default();
        runtime.broker.host = " ".to_string();
        runtime.topics.debug = String::new();
        runtime.device.publish_interval_secs = 0;
        runtime.device.reconnect_attempts = 0;
        runtime.panel.reading_capacity = 0;

        runtime.sanitize();

        assert_eq!(runtime.broker.host, "127.0.0.1");
        assert_eq!(runtime.topics.debug, TOPIC_DEBUG_OUTPUT);
        assert_eq!(runtime.device.publish_interval_secs, 1);
        assert_eq!(runtime.device.reconnect_attempts, 1);
        assert_eq!(runtime.panel.reading_capacity, 1);
    }

    #[test]
    fn script_limits_follow_device_config() {
        let limits = DeviceConfig::default().script_limits();
        assert_eq!(limits, ScriptLimits::default());
    }
}

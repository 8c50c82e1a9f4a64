use serde::{Deserialize, Serialize};

use crate::codec::sha256_hex;

pub const DEFAULT_SCRIPT_FILENAME: &str = "user_script.py";

/// Timestamp layout used on the wire and in the store.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: String,
    pub temp_dht11: f64,
    pub hum_dht11: f64,
    pub temp_ds18b20: f64,
    pub light_intensity: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePayload {
    #[serde(default = "default_filename")]
    pub filename: String,
    #[serde(default)]
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

fn default_filename() -> String {
    DEFAULT_SCRIPT_FILENAME.to_string()
}

impl UpdatePayload {
    pub fn new(filename: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            code: code.into(),
            sha256: None,
        }
    }

    /// Same as [`UpdatePayload::new`], with the digest of `code` attached.
    pub fn with_digest(filename: impl Into<String>, code: impl Into<String>) -> Self {
        let mut payload = Self::new(filename, code);
        payload.sha256 = Some(sha256_hex(&payload.code));
        payload
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugMessage {
    pub received_at: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSample {
    pub timestamp: String,
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    #[default]
    All,
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Morning => "morning",
            Self::Afternoon => "afternoon",
            Self::Evening => "evening",
            Self::Night => "night",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Some(Self::All),
            "morning" => Some(Self::Morning),
            "afternoon" => Some(Self::Afternoon),
            "evening" => Some(Self::Evening),
            "night" => Some(Self::Night),
            _ => None,
        }
    }

    // Daytime ranges include both ends, so 12:xx counts as morning and afternoon.
    pub fn contains_hour(self, hour: u32) -> bool {
        match self {
            Self::All => true,
            Self::Morning => (6..=12).contains(&hour),
            Self::Afternoon => (12..=18).contains(&hour),
            Self::Evening => (18..=21).contains(&hour),
            Self::Night => hour >= 21 || hour < 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_of_day_boundaries_overlap_like_the_dashboard() {
        assert!(TimeOfDay::Morning.contains_hour(12));
        assert!(TimeOfDay::Afternoon.contains_hour(12));
        assert!(TimeOfDay::Evening.contains_hour(21));
        assert!(TimeOfDay::Night.contains_hour(21));
        assert!(TimeOfDay::Night.contains_hour(0));
        assert!(!TimeOfDay::Night.contains_hour(6));
        assert!(!TimeOfDay::Morning.contains_hour(5));
    }

    #[test]
    fn parses_period_names() {
        assert_eq!(TimeOfDay::parse("Morning"), Some(TimeOfDay::Morning));
        assert_eq!(TimeOfDay::parse(""), Some(TimeOfDay::All));
        assert_eq!(TimeOfDay::parse("dusk"), None);
    }

    #[test]
    fn digest_is_attached_to_code() {
        let payload = UpdatePayload::with_digest("user_blink.py", "print(1)");
        assert_eq!(payload.sha256, Some(sha256_hex("print(1)")));
    }
}

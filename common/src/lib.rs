pub mod codec;
pub mod config;
pub mod ota;
pub mod script;
pub mod store;
pub mod topics;
pub mod types;

pub use codec::CodecError;
pub use config::{BrokerConfig, DeviceConfig, PanelConfig, RuntimeConfig, TopicConfig};
pub use ota::{OtaAgent, OtaError, ScriptStorage, UpdateReport};
pub use script::{DeviceHost, DeviceScript, ScriptError, ScriptLimits};
pub use store::BoundedSeries;
pub use topics::*;
pub use types::{DebugMessage, Reading, TemperatureSample, TimeOfDay, UpdatePayload};

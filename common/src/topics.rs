pub const TOPIC_SENSOR_READINGS: &str = "fyp/RemoteIoT";
pub const TOPIC_CODE_UPDATE: &str = "fyp/code_update";
pub const TOPIC_DEBUG_OUTPUT: &str = "fyp/debug_output";

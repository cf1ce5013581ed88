//! Marstek power meter to MQTT bridge
//!
//! Polls a Marstek HME power meter over its undocumented UDP protocol and
//! republishes per-phase power readings to MQTT, with Home Assistant
//! discovery metadata.

pub mod config;
pub mod metering_marstek;
pub mod mqtt;

// Re-export common types for easier access
pub use config::CONFIG;
pub use metering_marstek::MarstekManager;
pub use mqtt::MqttManager;

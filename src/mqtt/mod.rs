//! Home Assistant MQTT layer: discovery, state publishing and command
//! handling for every configured output.

pub mod bridge;
pub mod command;
pub mod entity;

pub use bridge::MqttBridge;
pub use entity::{build_entities, BridgeEntity};

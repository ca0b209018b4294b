//! scheiber2mqtt bridges a Scheiber marine lighting CAN bus to MQTT with
//! Home Assistant discovery.
//!
//! Inbound: `CanBus` -> `System::dispatch` -> `Bloc9::route` -> output
//! observers -> entity state publish. Outbound: MQTT command -> entity ->
//! output (possibly through a transition task) -> `CanBus`. Command echoes
//! on the bus are recognized by the matcher index and dropped.

pub mod can;
pub mod config;
pub mod device;
pub mod easing;
pub mod error;
pub mod mqtt;
pub mod output;
pub mod protocol;
pub mod state;
pub mod system;
pub mod transition;

pub use config::{load_config, BridgeConfig};
pub use error::BridgeError;
pub use system::System;

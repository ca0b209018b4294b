//! Home-Assistant-facing entities: one `MqttLight` or `MqttSwitch` per
//! configured output. Entities publish discovery documents and state, and
//! translate command payloads into calls on the underlying output — they
//! never touch the CAN layer themselves.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;

use crate::device::Bloc9;
use crate::easing::effect_names;
use crate::error::BridgeError;
use crate::mqtt::command::{check_retained_age, parse_light_command, parse_switch_command};
use crate::output::{DimmableLight, Output, Snapshot, Switch};

/// Fixed device block shared by every entity so Home Assistant groups them
/// under a single "Scheiber" device.
#[derive(Debug, Serialize)]
struct DeviceBlock {
    identifiers: [&'static str; 1],
    name: &'static str,
    model: &'static str,
}

const DEVICE_BLOCK: DeviceBlock = DeviceBlock {
    identifiers: ["scheiber_system"],
    name: "Scheiber",
    model: "Marine Lighting Control System",
};

#[derive(Debug, Clone)]
pub struct EntityTopics {
    pub config: String,
    pub state: String,
    pub command: String,
    pub availability: String,
}

fn entity_topics(
    prefix: &str,
    component: &str,
    entity_id: &str,
    device_type: &str,
    device_id: u8,
    slot_label: &str,
) -> EntityTopics {
    let base = format!("{prefix}/scheiber/{device_type}/{device_id}/{slot_label}");
    EntityTopics {
        config: format!("{prefix}/{component}/{entity_id}/config"),
        state: format!("{base}/state"),
        command: format!("{base}/set"),
        availability: format!("{base}/availability"),
    }
}

#[derive(Serialize)]
struct LightDiscovery<'a> {
    name: &'a str,
    unique_id: &'a str,
    schema: &'a str,
    state_topic: &'a str,
    command_topic: &'a str,
    availability_topic: &'a str,
    brightness: bool,
    brightness_scale: u16,
    supported_color_modes: [&'a str; 1],
    effect: bool,
    effect_list: Vec<&'a str>,
    flash: bool,
    device: &'a DeviceBlock,
}

#[derive(Serialize)]
struct SwitchDiscovery<'a> {
    name: &'a str,
    unique_id: &'a str,
    state_topic: &'a str,
    command_topic: &'a str,
    availability_topic: &'a str,
    payload_on: &'a str,
    payload_off: &'a str,
    device: &'a DeviceBlock,
}

#[derive(Serialize)]
struct LightStatePayload<'a> {
    state: &'a str,
    brightness: u8,
}

fn light_state_payload(snapshot: Snapshot) -> String {
    serde_json::to_string(&LightStatePayload {
        state: if snapshot.on { "ON" } else { "OFF" },
        brightness: snapshot.brightness,
    })
    .expect("state payload serializes")
}

fn switch_state_payload(snapshot: Snapshot) -> &'static str {
    if snapshot.on {
        "ON"
    } else {
        "OFF"
    }
}

pub struct MqttLight {
    light: DimmableLight,
    topics: EntityTopics,
    unique_id: String,
}

pub struct MqttSwitch {
    switch: Switch,
    topics: EntityTopics,
    unique_id: String,
}

impl MqttLight {
    pub fn new(light: DimmableLight, device_type: &str, prefix: &str) -> MqttLight {
        let info = light.info();
        let topics = entity_topics(
            prefix,
            "light",
            &info.entity_id,
            device_type,
            info.device_id,
            &info.slot_label(),
        );
        let unique_id = format!(
            "scheiber_{device_type}_{}_{}",
            info.device_id,
            info.slot_label()
        );
        MqttLight {
            light,
            topics,
            unique_id,
        }
    }

    fn discovery_json(&self) -> String {
        let doc = LightDiscovery {
            name: &self.light.info().display_name,
            unique_id: &self.unique_id,
            schema: "json",
            state_topic: &self.topics.state,
            command_topic: &self.topics.command,
            availability_topic: &self.topics.availability,
            brightness: true,
            brightness_scale: 255,
            supported_color_modes: ["brightness"],
            effect: true,
            effect_list: effect_names(),
            flash: true,
            device: &DEVICE_BLOCK,
        };
        serde_json::to_string(&doc).expect("discovery doc serializes")
    }
}

impl MqttSwitch {
    pub fn new(switch: Switch, device_type: &str, prefix: &str) -> MqttSwitch {
        let info = switch.info();
        let topics = entity_topics(
            prefix,
            "switch",
            &info.entity_id,
            device_type,
            info.device_id,
            &info.slot_label(),
        );
        let unique_id = format!(
            "scheiber_{device_type}_{}_{}",
            info.device_id,
            info.slot_label()
        );
        MqttSwitch {
            switch,
            topics,
            unique_id,
        }
    }

    fn discovery_json(&self) -> String {
        let doc = SwitchDiscovery {
            name: &self.switch.info().display_name,
            unique_id: &self.unique_id,
            state_topic: &self.topics.state,
            command_topic: &self.topics.command,
            availability_topic: &self.topics.availability,
            payload_on: "ON",
            payload_off: "OFF",
            device: &DEVICE_BLOCK,
        };
        serde_json::to_string(&doc).expect("discovery doc serializes")
    }
}

pub enum BridgeEntity {
    Light(MqttLight),
    Switch(MqttSwitch),
}

impl BridgeEntity {
    pub fn topics(&self) -> &EntityTopics {
        match self {
            BridgeEntity::Light(l) => &l.topics,
            BridgeEntity::Switch(s) => &s.topics,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            BridgeEntity::Light(l) => &l.light.info().entity_id,
            BridgeEntity::Switch(s) => &s.switch.info().entity_id,
        }
    }

    pub fn discovery_json(&self) -> String {
        match self {
            BridgeEntity::Light(l) => l.discovery_json(),
            BridgeEntity::Switch(s) => s.discovery_json(),
        }
    }

    pub fn current_state_payload(&self) -> String {
        match self {
            BridgeEntity::Light(l) => light_state_payload(l.light.snapshot()),
            BridgeEntity::Switch(s) => switch_state_payload(s.switch.snapshot()).to_string(),
        }
    }

    /// Subscribe to the underlying output so every confirmed state change
    /// is published, retained, QoS 1. `try_publish` keeps the observer
    /// callback synchronous; a full client queue is logged and dropped.
    pub fn attach_publisher(&self, client: &AsyncClient) {
        let topic = self.topics().state.clone();
        let entity_id = self.entity_id().to_string();
        match self {
            BridgeEntity::Light(l) => {
                let client = client.clone();
                l.light.subscribe(move |snap| {
                    let payload = light_state_payload(snap);
                    if let Err(e) = client.try_publish(&topic, QoS::AtLeastOnce, true, payload) {
                        warn!("{entity_id}: state publish failed: {e}");
                    }
                });
            }
            BridgeEntity::Switch(s) => {
                let client = client.clone();
                s.switch.subscribe(move |snap| {
                    let payload = switch_state_payload(snap);
                    if let Err(e) = client.try_publish(&topic, QoS::AtLeastOnce, true, payload) {
                        warn!("{entity_id}: state publish failed: {e}");
                    }
                });
            }
        }
    }

    /// Parse and apply one message from our command topic. A stale retained
    /// command is reported as an error so the runtime can clear the topic.
    pub async fn handle_command(&self, payload: &[u8], retained: bool) -> Result<(), BridgeError> {
        let topic = &self.topics().command;
        if retained {
            check_retained_age(payload, Utc::now())?;
        }
        match self {
            BridgeEntity::Light(l) => {
                let cmd = parse_light_command(topic, payload)?;
                debug!("{}: command {cmd:?}", self.entity_id());
                l.light.apply(&cmd).await;
            }
            BridgeEntity::Switch(s) => {
                let on = parse_switch_command(topic, payload)?;
                debug!("{}: command {}", self.entity_id(), if on { "ON" } else { "OFF" });
                s.switch.set(on).await;
            }
        }
        Ok(())
    }
}

/// One entity per configured output, across all devices.
pub fn build_entities(devices: &[Arc<Bloc9>], prefix: &str) -> Vec<BridgeEntity> {
    let mut entities = Vec::new();
    for device in devices {
        for (_, output) in device.outputs() {
            entities.push(match output {
                Output::Light(light) => {
                    BridgeEntity::Light(MqttLight::new(light.clone(), device.device_type(), prefix))
                }
                Output::Switch(switch) => BridgeEntity::Switch(MqttSwitch::new(
                    switch.clone(),
                    device.device_type(),
                    prefix,
                )),
            });
        }
    }
    entities
}

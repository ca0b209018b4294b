//! The Bloc9 device model: six output slots, the pattern-masked matcher
//! index built at construction, and frame routing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::can::FrameSink;
use crate::config::{slot_index, BridgeConfig, DeviceConfig, OutputKind};
use crate::error::BridgeError;
use crate::output::{DimmableLight, Output, OutputInfo, Switch};
use crate::protocol::{self, BusFrame, Half};
use crate::state::OutputState;

pub const DEVICE_TYPE_BLOC9: &str = "bloc9";

/// A frame matches iff `arb_id & mask == pattern`. Every matcher published
/// here uses the full 32-bit mask: a partial mask would alias across device
/// ids because the device byte sits in the low 8 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matcher {
    pub pattern: u32,
    pub mask: u32,
}

impl Matcher {
    pub fn exact(pattern: u32) -> Matcher {
        Matcher {
            pattern,
            mask: 0xFFFF_FFFF,
        }
    }

    pub fn matches(&self, arb_id: u32) -> bool {
        arb_id & self.mask == self.pattern
    }
}

enum RouteTarget {
    Heartbeat,
    CommandEcho,
    /// Pair-state frame carrying slots `2*pair` and `2*pair + 1`.
    Pair(usize),
}

/// What a device did with a frame handed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Not one of this device's patterns.
    NotMatched,
    /// Availability marker refreshed; no output was touched.
    Heartbeat,
    /// Echo of a command we sent; dropped.
    EchoDropped,
    /// Pair-state frame applied to its bound outputs.
    Updated,
    /// Matched a pair pattern but the payload was too short.
    Malformed,
}

pub struct Bloc9 {
    device_id: u8,
    slots: [Option<Output>; 6],
    index: HashMap<u32, RouteTarget>,
    last_heartbeat: Mutex<Option<Instant>>,
    heartbeat_hooks: Mutex<Vec<Box<dyn Fn(u8) + Send + Sync>>>,
}

impl Bloc9 {
    pub fn new(device_id: u8, slots: [Option<Output>; 6]) -> Result<Bloc9, BridgeError> {
        if !(1..=10).contains(&device_id) {
            return Err(BridgeError::ConfigInvalid(format!(
                "bloc9 device id {device_id} outside 1..=10"
            )));
        }

        let mut index = HashMap::new();
        index.insert(protocol::heartbeat_pattern(device_id), RouteTarget::Heartbeat);
        index.insert(protocol::command_pattern(device_id), RouteTarget::CommandEcho);
        for pair in 0..3 {
            if slots[2 * pair].is_some() || slots[2 * pair + 1].is_some() {
                index.insert(protocol::pair_pattern(pair, device_id), RouteTarget::Pair(pair));
            }
        }

        Ok(Bloc9 {
            device_id,
            slots,
            index,
            last_heartbeat: Mutex::new(None),
            heartbeat_hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn device_type(&self) -> &'static str {
        DEVICE_TYPE_BLOC9
    }

    /// Key of this device in the persisted state file.
    pub fn state_key(&self) -> String {
        format!("{}_{}", self.device_type(), self.device_id)
    }

    pub fn output(&self, slot: usize) -> Option<&Output> {
        self.slots.get(slot).and_then(|o| o.as_ref())
    }

    pub fn outputs(&self) -> impl Iterator<Item = (usize, &Output)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.as_ref().map(|o| (i, o)))
    }

    /// The full matcher set this device answers to.
    pub fn matchers(&self) -> Vec<Matcher> {
        self.index.keys().map(|&p| Matcher::exact(p)).collect()
    }

    /// Device-level notification raised on every heartbeat.
    pub fn on_heartbeat<F>(&self, cb: F)
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.heartbeat_hooks.lock().unwrap().push(Box::new(cb));
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        *self.last_heartbeat.lock().unwrap()
    }

    /// O(1) dispatch of one inbound frame.
    pub fn route(&self, frame: &BusFrame) -> RouteOutcome {
        match self.index.get(&frame.arb_id) {
            None => RouteOutcome::NotMatched,
            Some(RouteTarget::Heartbeat) => {
                *self.last_heartbeat.lock().unwrap() = Some(Instant::now());
                for hook in self.heartbeat_hooks.lock().unwrap().iter() {
                    hook(self.device_id);
                }
                RouteOutcome::Heartbeat
            }
            Some(RouteTarget::CommandEcho) => RouteOutcome::EchoDropped,
            Some(RouteTarget::Pair(pair)) => {
                if frame.data.len() < 8 {
                    return RouteOutcome::Malformed;
                }
                for (slot, half) in [(2 * pair, Half::Low), (2 * pair + 1, Half::High)] {
                    if let Some(output) = &self.slots[slot] {
                        output.process_level(protocol::decode_half(&frame.data, half));
                    }
                }
                RouteOutcome::Updated
            }
        }
    }

    /// Cancel and join every transition still running on this device's
    /// lights.
    pub async fn cancel_transitions(&self) {
        for (_, output) in self.outputs() {
            output.cancel_transition().await;
        }
    }

    /// Persisted shape of this device, keyed by entity id so slots can be
    /// renumbered without a state migration.
    pub fn export_state(&self) -> BTreeMap<String, OutputState> {
        let mut map = BTreeMap::new();
        for (_, output) in self.outputs() {
            let snap = output.snapshot();
            map.insert(
                output.entity_id().to_string(),
                OutputState {
                    state: snap.on,
                    brightness: if output.is_light() {
                        Some(snap.brightness)
                    } else {
                        None
                    },
                },
            );
        }
        map
    }

    /// Seed outputs from a previously persisted map. Unknown entity ids
    /// (including the legacy slot-keyed shape) are ignored.
    pub fn import_state(&self, saved: &BTreeMap<String, OutputState>) {
        for (_, output) in self.outputs() {
            if let Some(st) = saved.get(output.entity_id()) {
                output.seed(st.state, st.brightness);
            }
        }
    }
}

/// Construct every configured device against the shared frame sink.
/// Configuration must already be validated; this rejects only what it cannot
/// represent.
pub fn build_devices(
    config: &BridgeConfig,
    sink: Arc<dyn FrameSink>,
) -> Result<Vec<Bloc9>, BridgeError> {
    config
        .devices
        .iter()
        .map(|dev| build_device(dev, sink.clone()))
        .collect()
}

fn build_device(dev: &DeviceConfig, sink: Arc<dyn FrameSink>) -> Result<Bloc9, BridgeError> {
    if dev.device_type != DEVICE_TYPE_BLOC9 {
        return Err(BridgeError::ConfigInvalid(format!(
            "unknown device type '{}'",
            dev.device_type
        )));
    }

    let mut slots: [Option<Output>; 6] = Default::default();
    for (slot_name, out) in &dev.outputs {
        let slot = slot_index(slot_name).ok_or_else(|| {
            BridgeError::ConfigInvalid(format!("invalid slot '{slot_name}'"))
        })?;
        let info = OutputInfo {
            device_id: dev.device_id,
            switch_nr: slot as u8,
            entity_id: out.entity_id.clone(),
            display_name: if out.display_name.is_empty() {
                out.entity_id.clone()
            } else {
                out.display_name.clone()
            },
        };
        slots[slot] = Some(match out.kind {
            OutputKind::Light => Output::Light(DimmableLight::new(info, sink.clone())),
            OutputKind::Switch => Output::Switch(Switch::new(info, sink.clone())),
        });
    }

    Bloc9::new(dev.device_id, slots)
}

//! Parsing of inbound command payloads: the Home-Assistant JSON light
//! grammar, plain ON/OFF, and the age gate for retained commands.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::easing::EasingKind;
use crate::error::BridgeError;
use crate::output::LightCommand;

/// Retained commands older than this are replays from before a restart and
/// must not move any output.
pub const MAX_RETAINED_AGE: Duration = Duration::from_secs(300);

pub const FLASH_SHORT: Duration = Duration::from_secs(2);
pub const FLASH_LONG: Duration = Duration::from_secs(10);

/// The raw JSON grammar. Everything is optional; `"ON"`/`"OFF"` as a bare
/// string payload is handled before this is deserialized.
#[derive(Debug, Deserialize)]
struct RawLightCommand {
    state: Option<String>,
    brightness: Option<u8>,
    transition: Option<f64>,
    effect: Option<String>,
    flash: Option<FlashField>,
    /// Epoch seconds, set by publishers that want the retained age gate to
    /// apply. Home Assistant itself does not send this.
    timestamp: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FlashField {
    Named(String),
    Seconds(f64),
}

fn parse_state(s: &str) -> Option<bool> {
    match s {
        "ON" => Some(true),
        "OFF" => Some(false),
        _ => None,
    }
}

fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// Parse a light command payload. Unknown effect names are dropped from the
/// command (the rest still applies) since HA only offers what we advertised.
pub fn parse_light_command(topic: &str, payload: &[u8]) -> Result<LightCommand, BridgeError> {
    let text = std::str::from_utf8(payload).map_err(|_| BridgeError::MqttParseFailed {
        topic: topic.to_string(),
        reason: "payload is not UTF-8".to_string(),
    })?;
    let trimmed = text.trim();

    if let Some(on) = parse_state(trimmed) {
        return Ok(LightCommand {
            on: Some(on),
            ..LightCommand::default()
        });
    }

    let raw: RawLightCommand =
        serde_json::from_str(trimmed).map_err(|e| BridgeError::MqttParseFailed {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

    let on = match raw.state.as_deref() {
        None => None,
        Some(s) => Some(parse_state(s).ok_or_else(|| BridgeError::MqttParseFailed {
            topic: topic.to_string(),
            reason: format!("bad state '{s}'"),
        })?),
    };

    let flash = match raw.flash {
        None => None,
        Some(FlashField::Named(name)) => match name.as_str() {
            "short" => Some(FLASH_SHORT),
            "long" => Some(FLASH_LONG),
            other => {
                return Err(BridgeError::MqttParseFailed {
                    topic: topic.to_string(),
                    reason: format!("bad flash '{other}'"),
                })
            }
        },
        Some(FlashField::Seconds(secs)) => Some(seconds(secs)),
    };

    let effect = raw.effect.as_deref().and_then(|name| {
        let parsed = EasingKind::from_name(name);
        if parsed.is_none() {
            log::warn!("{topic}: ignoring unknown effect '{name}'");
        }
        parsed
    });

    Ok(LightCommand {
        on,
        brightness: raw.brightness,
        transition: raw.transition.map(seconds),
        effect,
        flash,
    })
}

/// Plain switch grammar: ON or OFF, nothing else.
pub fn parse_switch_command(topic: &str, payload: &[u8]) -> Result<bool, BridgeError> {
    std::str::from_utf8(payload)
        .ok()
        .and_then(|s| parse_state(s.trim()))
        .ok_or_else(|| BridgeError::MqttParseFailed {
            topic: topic.to_string(),
            reason: "expected ON or OFF".to_string(),
        })
}

/// Age of a retained command, when its payload carries a timestamp.
/// Commands without one are treated as fresh.
pub fn retained_age(payload: &[u8], now: DateTime<Utc>) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    let stamp = value.get("timestamp")?.as_f64()?;
    let age = now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0 - stamp;
    if age <= 0.0 {
        return Some(Duration::ZERO);
    }
    Some(Duration::from_secs_f64(age))
}

/// Apply the gate: `Err(StaleRetainedCommand)` means drop the message and
/// clear the retained topic.
pub fn check_retained_age(payload: &[u8], now: DateTime<Utc>) -> Result<(), BridgeError> {
    match retained_age(payload, now) {
        Some(age) if age > MAX_RETAINED_AGE => Err(BridgeError::StaleRetainedCommand {
            age_secs: age.as_secs_f64(),
        }),
        _ => Ok(()),
    }
}

//! Last-known output state, persisted as JSON and reloaded at startup so a
//! restart does not present every entity as off.
//!
//! The file is keyed `"<device_type>_<device_id>" -> "<entity_id>" ->
//! {state[, brightness]}`. Keying by entity id makes renaming an entity a
//! breaking change but keeps slot renumbering free.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// How often the dirty state is rewritten.
pub const SAVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputState {
    pub state: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
}

pub type StateMap = BTreeMap<String, BTreeMap<String, OutputState>>;

pub fn default_state_path() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("scheiber2mqtt");
    path.push("state.json");
    path
}

/// Read the state file once at startup. Anything unreadable is logged and
/// treated as absent; the bridge then starts from all-off.
pub fn load(path: &Path) -> Option<StateMap> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(_) => return None,
    };
    match serde_json::from_str(&data) {
        Ok(map) => Some(map),
        Err(e) => {
            warn!("ignoring unreadable state file {}: {e}", path.display());
            None
        }
    }
}

pub fn save(path: &Path, map: &StateMap) -> Result<(), BridgeError> {
    let persist = |source| BridgeError::StatePersistIoFailed {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(persist)?;
    }
    let json = serde_json::to_string_pretty(map).expect("state map serializes");
    fs::write(path, json).map_err(persist)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_shape_is_keyed_by_device_then_entity() {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "nav_light".to_string(),
            OutputState { state: true, brightness: Some(128) },
        );
        outputs.insert("bilge_pump".to_string(), OutputState { state: false, brightness: None });
        let mut map = StateMap::new();
        map.insert("bloc9_7".to_string(), outputs);

        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "bloc9_7": {
                    "bilge_pump": { "state": false },
                    "nav_light": { "state": true, "brightness": 128 }
                }
            })
        );
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = std::env::temp_dir().join("scheiber2mqtt-state-test");
        let path = dir.join("state.json");
        let _ = fs::remove_file(&path);

        let mut map = StateMap::new();
        map.insert("bloc9_1".to_string(), {
            let mut m = BTreeMap::new();
            m.insert("galley".to_string(), OutputState { state: true, brightness: Some(42) });
            m
        });

        save(&path, &map).unwrap();
        assert_eq!(load(&path), Some(map));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_or_corrupt_file_is_absent() {
        assert_eq!(load(Path::new("/nonexistent/state.json")), None);

        let path = std::env::temp_dir().join("scheiber2mqtt-corrupt-state.json");
        fs::write(&path, "{not json").unwrap();
        assert_eq!(load(&path), None);
        let _ = fs::remove_file(&path);
    }
}

//! Persisted preferences
//!
//! Small string-keyed store for the handful of values that survive a
//! restart: the chosen devices, the last confirmed region and the save
//! folder. Writes go straight to disk; the store is tiny and contention is
//! nil.

use crate::capture::types::CaptureSourceKind;
use crate::error::SessionResult;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const KEY_SELECTED_REGION: &str = "selectedRegion";
pub const KEY_SAVE_FOLDER: &str = "saveFolder";

/// Settings key for the preferred device of one source kind
pub fn device_key(kind: CaptureSourceKind) -> String {
    let suffix = match kind {
        CaptureSourceKind::Microphone => "microphone",
        CaptureSourceKind::Screen => "screen",
        CaptureSourceKind::SystemAudio => "systemAudio",
    };
    format!("selectedDevice.{suffix}")
}

/// Where delivery files land when the caller gives no explicit path
pub fn default_save_folder() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> SessionResult<()>;
}

/// [`SettingsStore`] backed by one JSON file.
pub struct JsonFileSettings {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
}

impl JsonFileSettings {
    /// Open the store, reading existing values if the file is present.
    /// A missing or unreadable file starts the store empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    tracing::warn!(path = %path.display(), "settings file is not a JSON object; starting fresh");
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        };
        Self { path, values: Mutex::new(values) }
    }

    fn persist(&self, values: &Map<String, Value>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&Value::Object(values.clone()))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, text)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    fn set(&self, key: &str, value: &str) -> SessionResult<()> {
        let mut values = self.values.lock();
        values.insert(key.to_string(), Value::String(value.to_string()));
        self.persist(&values)?;
        tracing::debug!(key, "setting persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSettings::open(dir.path().join("settings.json"));
        store.set(KEY_SAVE_FOLDER, "/tmp/captures").unwrap();
        assert_eq!(store.get(KEY_SAVE_FOLDER).as_deref(), Some("/tmp/captures"));
        assert_eq!(store.get("unknownKey"), None);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        {
            let store = JsonFileSettings::open(path.clone());
            store
                .set(&device_key(CaptureSourceKind::Microphone), "usb-mic-3")
                .unwrap();
        }
        let reopened = JsonFileSettings::open(path.clone());
        assert_eq!(
            reopened.get("selectedDevice.microphone").as_deref(),
            Some("usb-mic-3")
        );
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json at all").unwrap();
        let store = JsonFileSettings::open(path.clone());
        assert_eq!(store.get(KEY_SELECTED_REGION), None);
        store.set(KEY_SELECTED_REGION, "{}").unwrap();
        assert_eq!(store.get(KEY_SELECTED_REGION).as_deref(), Some("{}"));
    }
}

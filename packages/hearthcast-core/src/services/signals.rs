//! Environment signals consumed by the audio-hardware configuration layer.
//!
//! Routing decisions are communicated downstream as two string signals: one
//! encoding direct-vs-multiroom, one encoding equalizer-on/off. The default
//! sink writes them as `KEY=VALUE` lines into an env file under the state
//! directory, atomically (temp file + rename), so concurrent readers never
//! observe a partial write.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{HearthError, HearthResult};

/// Key for the routing signal. Values: `direct` | `multiroom`.
pub const ROUTING_SIGNAL_KEY: &str = "HEARTHCAST_ROUTING";

/// Key for the equalizer signal. Values: `on` | `off`.
pub const EQUALIZER_SIGNAL_KEY: &str = "HEARTHCAST_EQUALIZER";

/// Push interface for the two downstream configuration signals.
pub trait SignalSink: Send + Sync {
    /// Pushes the routing signal.
    fn set_routing(&self, multiroom: bool) -> HearthResult<()>;

    /// Pushes the equalizer signal.
    fn set_equalizer(&self, enabled: bool) -> HearthResult<()>;
}

/// [`SignalSink`] writing an env file in the service state directory.
pub struct EnvFileSignalSink {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    write_lock: Mutex<()>,
}

impl EnvFileSignalSink {
    /// Creates a sink writing to `<state_dir>/audio.env`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("audio.env"),
            write_lock: Mutex::new(()),
        }
    }

    fn load(&self) -> BTreeMap<String, String> {
        let mut entries = BTreeMap::new();
        if let Ok(contents) = std::fs::read_to_string(&self.path) {
            for line in contents.lines() {
                if let Some((key, value)) = line.split_once('=') {
                    entries.insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }
        entries
    }

    fn set(&self, key: &str, value: &str) -> HearthResult<()> {
        let _guard = self.write_lock.lock();
        let mut entries = self.load();
        entries.insert(key.to_string(), value.to_string());

        let rendered: String = entries
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect();

        let parent = self
            .path
            .parent()
            .ok_or_else(|| HearthError::Persistence("signal path has no parent".into()))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| HearthError::Persistence(format!("create {}: {e}", parent.display())))?;

        let temp_path = self.path.with_extension("env.tmp");
        std::fs::write(&temp_path, rendered)
            .map_err(|e| HearthError::Persistence(format!("write signal file: {e}")))?;
        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| HearthError::Persistence(format!("replace signal file: {e}")))?;
        Ok(())
    }
}

impl SignalSink for EnvFileSignalSink {
    fn set_routing(&self, multiroom: bool) -> HearthResult<()> {
        let value = if multiroom { "multiroom" } else { "direct" };
        log::info!("[Signals] {}={}", ROUTING_SIGNAL_KEY, value);
        self.set(ROUTING_SIGNAL_KEY, value)
    }

    fn set_equalizer(&self, enabled: bool) -> HearthResult<()> {
        let value = if enabled { "on" } else { "off" };
        log::info!("[Signals] {}={}", EQUALIZER_SIGNAL_KEY, value);
        self.set(EQUALIZER_SIGNAL_KEY, value)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_are_written_and_updated_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let sink = EnvFileSignalSink::new(dir.path());

        sink.set_routing(true).unwrap();
        sink.set_equalizer(false).unwrap();
        sink.set_routing(false).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("audio.env")).unwrap();
        assert!(contents.contains("HEARTHCAST_ROUTING=direct"));
        assert!(contents.contains("HEARTHCAST_EQUALIZER=off"));
        // Exactly one line per key survives repeated pushes.
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn missing_state_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("deep/state");
        let sink = EnvFileSignalSink::new(&nested);

        sink.set_equalizer(true).unwrap();
        assert!(nested.join("audio.env").exists());
    }
}

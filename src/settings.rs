// Persisted agent state.
//
// The only thing that survives a restart is the AuthState blob (bearer token,
// device identity, signaling endpoint, user handle). The store itself is an
// injected capability so hosts can keep it wherever they like; the JSON-file
// implementation covers the CLI host.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Credentials and endpoints issued at login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    pub token: String,
    pub device_id: String,
    pub signaling_url: String,
    pub user_handle: String,
}

pub trait SettingsStore: Send + Sync {
    fn load_auth_state(&self) -> AppResult<Option<AuthState>>;
    fn save_auth_state(&self, state: &AuthState) -> AppResult<()>;
    fn clear_auth_state(&self) -> AppResult<()>;
}

/// File-backed store: one JSON blob under the settings directory.
pub struct JsonSettingsStore {
    dir: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.burrow` (or the current directory when HOME is unset).
    pub fn default_location() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".burrow"))
    }

    fn auth_path(&self) -> PathBuf {
        self.dir.join("auth.json")
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load_auth_state(&self) -> AppResult<Option<AuthState>> {
        let path = self.auth_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let state = serde_json::from_str(&raw)
            .map_err(|e| AppError::Settings(format!("corrupt auth state: {e}")))?;
        Ok(Some(state))
    }

    fn save_auth_state(&self, state: &AuthState) -> AppResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| AppError::Settings(format!("encode auth state: {e}")))?;
        write_private(&self.auth_path(), json.as_bytes())?;
        Ok(())
    }

    fn clear_auth_state(&self) -> AppResult<()> {
        let path = self.auth_path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

/// In-memory store for tests and embedded hosts.
#[derive(Default)]
pub struct MemorySettingsStore {
    state: Mutex<Option<AuthState>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auth_state(state: AuthState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load_auth_state(&self) -> AppResult<Option<AuthState>> {
        Ok(self.state.lock().expect("settings lock poisoned").clone())
    }

    fn save_auth_state(&self, state: &AuthState) -> AppResult<()> {
        *self.state.lock().expect("settings lock poisoned") = Some(state.clone());
        Ok(())
    }

    fn clear_auth_state(&self) -> AppResult<()> {
        *self.state.lock().expect("settings lock poisoned") = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AuthState {
        AuthState {
            token: "tok".into(),
            device_id: "dev-1".into(),
            signaling_url: "https://cloud.example/signal".into(),
            user_handle: "alice@example.com".into(),
        }
    }

    #[test]
    fn json_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSettingsStore::new(dir.path().join("settings"));

        assert_eq!(store.load_auth_state().unwrap(), None);

        store.save_auth_state(&sample()).unwrap();
        assert_eq!(store.load_auth_state().unwrap(), Some(sample()));

        store.clear_auth_state().unwrap();
        assert_eq!(store.load_auth_state().unwrap(), None);
    }

    #[test]
    fn json_store_overwrites_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSettingsStore::new(dir.path());

        store.save_auth_state(&sample()).unwrap();
        let mut updated = sample();
        updated.token = "tok-2".into();
        store.save_auth_state(&updated).unwrap();

        assert_eq!(store.load_auth_state().unwrap(), Some(updated));
    }

    #[test]
    fn corrupt_state_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSettingsStore::new(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path().join("auth.json"), b"{not json").unwrap();

        assert!(store.load_auth_state().is_err());
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemorySettingsStore::new();
        assert_eq!(store.load_auth_state().unwrap(), None);
        store.save_auth_state(&sample()).unwrap();
        assert_eq!(store.load_auth_state().unwrap(), Some(sample()));
        store.clear_auth_state().unwrap();
        assert_eq!(store.load_auth_state().unwrap(), None);
    }
}

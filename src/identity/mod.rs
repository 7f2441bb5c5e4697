use crate::model::DeviceIdentity;
use crate::persist;
use crate::platform::{PlatformClient, PlatformError};
use serde_json::{Map, Value};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Why the process has to stop. Both variants have already removed the
/// persisted state by the time they are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The platform rejected this device's credentials.
    AuthRevoked,
    /// The platform told this exact device to delete itself.
    RemoteDelete,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("identity io error: {0}")]
    Io(#[from] io::Error),
    #[error("identity encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("platform answered for device {received}, expected {held}")]
    DeviceMismatch { held: String, received: String },
    #[error("update did not produce a valid identity")]
    Invalid,
    #[error("device identity terminated: {0:?}")]
    Terminated(Termination),
}

/// Owns the device identity file and the in-memory copy of it.
#[derive(Debug)]
pub struct IdentityStore {
    path: PathBuf,
    scene_path: PathBuf,
    current: Mutex<Option<DeviceIdentity>>,
}

impl IdentityStore {
    /// Opens the store and loads whatever identity is on disk.
    pub fn open(path: impl Into<PathBuf>, scene_path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = load_from(&path);
        Self {
            path,
            scene_path: scene_path.into(),
            current: Mutex::new(current),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the identity file. Malformed content counts as absent.
    pub fn load(&self) -> Option<DeviceIdentity> {
        let loaded = load_from(&self.path);
        *self.lock() = loaded.clone();
        loaded
    }

    pub fn current(&self) -> Option<DeviceIdentity> {
        self.lock().clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.lock().as_ref().map(|i| i.device_id.clone())
    }

    /// Creates the device on first run, otherwise pushes `desired` as an
    /// update. The result is persisted before it is returned.
    pub async fn register_or_update(
        &self,
        platform: &PlatformClient,
        desired: &Map<String, Value>,
    ) -> Result<DeviceIdentity, IdentityError> {
        let existing = self.current();
        let result = match &existing {
            None => {
                tracing::info!("no stored identity, registering device");
                platform.create_device(desired).await
            }
            Some(identity) => {
                tracing::info!(device_id = %identity.device_id, "updating registered device");
                match platform.update_device(identity, desired).await {
                    Ok(update) => Ok(self.checked_merge(identity, &update)?),
                    Err(err) => Err(err),
                }
            }
        };

        let identity = match result {
            Ok(identity) => identity,
            Err(err) if err.is_not_authorized() => {
                return Err(IdentityError::Terminated(self.on_auth_revoked()));
            }
            Err(err) => return Err(err.into()),
        };

        self.save(&identity)?;
        Ok(identity)
    }

    /// Merges a platform-pushed update into the held identity and persists it.
    pub fn apply_update(&self, update: &Map<String, Value>) -> Result<DeviceIdentity, IdentityError> {
        let identity = match self.current() {
            Some(existing) => self.checked_merge(&existing, update)?,
            None => DeviceIdentity::from_value(Value::Object(update.clone()))
                .ok_or(IdentityError::Invalid)?,
        };
        self.save(&identity)?;
        Ok(identity)
    }

    /// Writes `identity` and makes it the held copy. The file is replaced
    /// atomically, so a failed write keeps the previous identity on disk.
    pub fn save(&self, identity: &DeviceIdentity) -> Result<(), IdentityError> {
        let data = serde_json::to_vec(identity)?;
        persist::write_atomic(&self.path, &data)?;
        *self.lock() = Some(identity.clone());
        Ok(())
    }

    pub fn set_direct_url(&self, direct_url: Option<String>) {
        if let Some(identity) = self.lock().as_mut() {
            identity.direct_url = direct_url;
        }
    }

    pub fn on_auth_revoked(&self) -> Termination {
        tracing::error!(path = %self.path.display(), "not authenticated, deleting device info");
        self.delete_files(false);
        Termination::AuthRevoked
    }

    /// Deletes everything only when `claimed` names this device's id *and*
    /// token. Returns `None` for any other device.
    pub fn on_remote_delete(&self, claimed: &Value) -> Option<Termination> {
        if !self.is_claimed_by(claimed) {
            return None;
        }
        tracing::warn!(path = %self.path.display(), "platform deleted this device, removing local state");
        self.delete_files(true);
        Some(Termination::RemoteDelete)
    }

    pub fn is_claimed_by(&self, claimed: &Value) -> bool {
        let guard = self.lock();
        let Some(identity) = guard.as_ref() else {
            return false;
        };
        let id = claimed.get("deviceId").and_then(Value::as_str);
        let token = claimed.get("deviceToken").and_then(Value::as_str);
        id == Some(identity.device_id.as_str()) && token == Some(identity.device_token.as_str())
    }

    fn checked_merge(
        &self,
        existing: &DeviceIdentity,
        update: &Map<String, Value>,
    ) -> Result<DeviceIdentity, IdentityError> {
        if let Some(received) = update.get("deviceId").and_then(Value::as_str) {
            if received != existing.device_id {
                return Err(IdentityError::DeviceMismatch {
                    held: existing.device_id.clone(),
                    received: received.to_string(),
                });
            }
        }
        existing.merged_with(update).ok_or(IdentityError::Invalid)
    }

    fn delete_files(&self, include_scenes: bool) {
        *self.lock() = None;
        if let Err(err) = persist::remove_if_exists(&self.path) {
            tracing::error!(error = %err, "failed to delete identity file");
        }
        if include_scenes {
            if let Err(err) = persist::remove_if_exists(&self.scene_path) {
                tracing::error!(error = %err, "failed to delete scene cache file");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<DeviceIdentity>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_from(path: &Path) -> Option<DeviceIdentity> {
    persist::read_json::<Value>(path).and_then(DeviceIdentity::from_value)
}

//! Stable per-installation device identity.

use crate::db::{keys, StateStore};
use crate::error::StateError;
use squad_engine::DeviceId;

/// Load the device id, generating and persisting one on first run.
pub async fn load_or_create_device_id(state: &dyn StateStore) -> Result<DeviceId, StateError> {
    if let Some(id) = state.load(keys::DEVICE_ID).await? {
        if !id.trim().is_empty() {
            return Ok(id);
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    state.save(keys::DEVICE_ID, &id).await?;
    tracing::info!(device_id = %id, "Generated new device id");
    Ok(id)
}

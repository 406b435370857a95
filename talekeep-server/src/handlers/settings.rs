//! Settings endpoints. Secret values are encrypted through the vault when
//! one is configured; without a vault a secret write is rejected rather
//! than silently stored in the clear.

use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use talekeep_model::Setting;

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

pub async fn get_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> AppResult<Json<Value>> {
    let setting = state
        .store
        .get_setting(&key)
        .await?
        .ok_or_else(|| AppError::not_found(format!("setting {key}")))?;

    let value = if setting.is_secret {
        match &state.vault {
            Some(vault) => Some(vault.decrypt(&setting.value)?),
            // Without the key the ciphertext stays opaque.
            None => None,
        }
    } else {
        Some(setting.value.clone())
    };

    Ok(Json(json!({
        "key": setting.key,
        "value": value,
        "is_secret": setting.is_secret,
        "updated_at": setting.updated_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PutSettingRequest {
    pub value: String,
    #[serde(default)]
    pub is_secret: bool,
}

pub async fn put_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<PutSettingRequest>,
) -> AppResult<Json<Value>> {
    let value = if request.is_secret {
        let vault = state.vault.as_ref().ok_or_else(|| {
            AppError::bad_request("secret settings require a configured secrets passphrase")
        })?;
        vault.encrypt(&request.value)?
    } else {
        request.value
    };

    let setting = Setting {
        key: key.clone(),
        value,
        is_secret: request.is_secret,
        updated_at: Utc::now(),
    };
    state.store.set_setting(&setting).await?;
    Ok(Json(json!({ "key": key, "is_secret": request.is_secret })))
}

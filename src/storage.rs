//! Backend credentials in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Only the backend URL, the device
//! API key and the provisioned shop id live here; everything else is in
//! SQLite.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::api::{normalize_backend_url, ConnectionString};
use crate::db::{self, DbState};

const SERVICE_NAME: &str = "shop-pos";

// Credential keys
const KEY_BACKEND_URL: &str = "backend_url";
const KEY_API_KEY: &str = "pos_api_key";
const KEY_SHOP_ID: &str = "shop_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_BACKEND_URL, KEY_API_KEY, KEY_SHOP_ID];

/// Where and how to reach the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCredentials {
    pub backend_url: String,
    pub api_key: Zeroizing<String>,
    pub shop_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())
}

/// Delete a credential. Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Configured once both the backend URL and the API key are stored.
pub fn is_configured() -> bool {
    load_backend_credentials().is_some()
}

pub fn load_backend_credentials() -> Option<BackendCredentials> {
    let backend_url = get_credential(KEY_BACKEND_URL).filter(|s| !s.trim().is_empty())?;
    let api_key = get_credential(KEY_API_KEY).filter(|s| !s.trim().is_empty())?;
    Some(BackendCredentials {
        backend_url,
        api_key: Zeroizing::new(api_key),
        shop_id: get_credential(KEY_SHOP_ID),
    })
}

/// Validate a provisioning payload without touching the keyring.
///
/// Accepts `{ "backendUrl", "apiKey", "shopId" }`. `apiKey` may instead
/// hold a whole connection string, whose fields then take precedence.
pub fn parse_credentials_payload(payload: &Value) -> Result<BackendCredentials, String> {
    let raw_api_key =
        payload_field(payload, &["apiKey", "api_key"]).ok_or("Missing required field: apiKey")?;
    let mut backend_url = payload_field(payload, &["backendUrl", "backend_url", "url"]);
    let mut shop_id = payload_field(payload, &["shopId", "shop_id"]);
    let mut api_key = raw_api_key.clone();

    if let Some(decoded) = ConnectionString::parse(&raw_api_key) {
        api_key = decoded.api_key;
        backend_url = Some(decoded.url);
        if decoded.shop_id.is_some() {
            shop_id = decoded.shop_id;
        }
    }

    let backend_url = backend_url
        .map(|u| normalize_backend_url(&u))
        .filter(|u| !u.is_empty())
        .ok_or("Missing required field: backendUrl")?;

    Ok(BackendCredentials {
        backend_url,
        api_key: Zeroizing::new(api_key),
        shop_id,
    })
}

fn payload_field(payload: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| payload.get(*name).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Store backend credentials received during provisioning.
pub fn update_backend_credentials(payload: &Value) -> Result<BackendCredentials, String> {
    let credentials = parse_credentials_payload(payload)?;

    set_credential(KEY_BACKEND_URL, &credentials.backend_url)?;
    set_credential(KEY_API_KEY, credentials.api_key.as_str())?;
    match credentials.shop_id.as_deref() {
        Some(shop_id) => set_credential(KEY_SHOP_ID, shop_id)?,
        None => delete_credential(KEY_SHOP_ID)?,
    }

    info!(backend_url = %credentials.backend_url, "backend credentials updated");
    Ok(credentials)
}

/// Delete every stored credential and all locally cached data, including
/// operations that were never synced.
pub fn factory_reset(db: &DbState) -> Result<(), String> {
    info!("performing factory reset: deleting credentials and local data");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::clear_local_data(&conn)
}

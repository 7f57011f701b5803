//! Canvas secrets: encrypted JSON objects of string values, decrypted per
//! use and never cached.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use db::models::EventSourceRow;
use db::Store;

use crate::models::{SecretKeyRef, Stage};
use crate::EngineError;

/// The only provider stored in-tree.
pub const LOCAL_PROVIDER: &str = "local";

/// Symmetric encryption for secrets and source keys. `associated_data`
/// binds a ciphertext to its owner (secret name or source name).
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, EngineError>;
    fn decrypt(&self, ciphertext: &[u8], associated_data: &[u8]) -> Result<Vec<u8>, EngineError>;
}

/// Stores bytes as-is. For development and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEncryptor;

impl Encryptor for NoOpEncryptor {
    fn encrypt(&self, plaintext: &[u8], _associated_data: &[u8]) -> Result<Vec<u8>, EngineError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8], _associated_data: &[u8]) -> Result<Vec<u8>, EngineError> {
        Ok(ciphertext.to_vec())
    }
}

/// Encrypt a `local` secret's values for storage.
pub fn seal_values(
    encryptor: &dyn Encryptor,
    name: &str,
    values: &BTreeMap<String, String>,
) -> Result<Vec<u8>, EngineError> {
    let plaintext = serde_json::to_vec(values).map_err(|e| EngineError::Secret {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    encryptor.encrypt(&plaintext, name.as_bytes())
}

/// Encrypt an event source's signing key, bound to the source name.
pub fn seal_source_key(
    encryptor: &dyn Encryptor,
    source_name: &str,
    key: &str,
) -> Result<Vec<u8>, EngineError> {
    encryptor.encrypt(key.as_bytes(), source_name.as_bytes())
}

/// The plaintext signing key of an event source.
pub fn source_key(encryptor: &dyn Encryptor, source: &EventSourceRow) -> Result<Vec<u8>, EngineError> {
    encryptor.decrypt(&source.key, source.name.as_bytes())
}

/// Load and decrypt every value of a canvas secret.
pub async fn load_values(
    store: &dyn Store,
    encryptor: &dyn Encryptor,
    canvas_id: Uuid,
    name: &str,
) -> Result<Map<String, Value>, EngineError> {
    let secret_error = |message: String| EngineError::Secret { name: name.to_string(), message };

    let row = store.find_secret_by_name(canvas_id, name).await.map_err(|e| match e {
        db::DbError::NotFound => secret_error("not found".into()),
        other => EngineError::Database(other),
    })?;
    if row.provider != LOCAL_PROVIDER {
        return Err(secret_error(format!("unsupported provider '{}'", row.provider)));
    }

    let plaintext = encryptor.decrypt(&row.data, name.as_bytes())?;
    let values: Map<String, Value> =
        serde_json::from_slice(&plaintext).map_err(|e| secret_error(e.to_string()))?;
    if let Some((key, _)) = values.iter().find(|(_, v)| !v.is_string()) {
        return Err(secret_error(format!("value of '{key}' is not a string")));
    }
    Ok(values)
}

/// Resolve one `{name, key}` reference.
pub async fn resolve_key(
    store: &dyn Store,
    encryptor: &dyn Encryptor,
    canvas_id: Uuid,
    reference: &SecretKeyRef,
) -> Result<Value, EngineError> {
    let values = load_values(store, encryptor, canvas_id, &reference.name).await?;
    values.get(&reference.key).cloned().ok_or_else(|| EngineError::Secret {
        name: reference.name.clone(),
        message: format!("key '{}' not found", reference.key),
    })
}

/// Resolve every secret a stage declares into `name -> value`.
pub async fn resolve_stage_secrets(
    store: &dyn Store,
    encryptor: &dyn Encryptor,
    stage: &Stage,
) -> Result<Map<String, Value>, EngineError> {
    let mut loaded: HashMap<&str, Map<String, Value>> = HashMap::new();
    let mut resolved = Map::new();

    for definition in &stage.secrets {
        let reference = &definition.value_from.secret;
        if !loaded.contains_key(reference.name.as_str()) {
            let values = load_values(store, encryptor, stage.canvas_id, &reference.name).await?;
            loaded.insert(reference.name.as_str(), values);
        }
        let value = loaded
            .get(reference.name.as_str())
            .and_then(|values| values.get(&reference.key))
            .cloned()
            .ok_or_else(|| EngineError::Secret {
                name: reference.name.clone(),
                message: format!("key '{}' not found", reference.key),
            })?;
        resolved.insert(definition.name.clone(), value);
    }

    debug!(stage_id = %stage.id, count = resolved.len(), "resolved stage secrets");
    Ok(resolved)
}

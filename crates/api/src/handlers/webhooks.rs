//! Webhook intake. Verification has to stay quick: the event is stored
//! as-is and every other decision is left to the router.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use db::models::SourceType;
use db::{DbError, NewRawEvent};
use engine::secrets::source_key;

use super::{header_str, read_capped};
use crate::signature;
use crate::{ApiError, AppState};

/// Event payloads can be up to 64 KiB.
pub const MAX_EVENT_SIZE: usize = 64 * 1024;

pub const ORGANIZATION_HEADER: &str = "x-organization-id";

/// The signature header each provider sends.
fn signature_header(provider: &str) -> Option<&'static str> {
    match provider {
        "github" => Some("x-hub-signature-256"),
        "semaphore" => Some("x-semaphore-signature-256"),
        _ => None,
    }
}

#[instrument(skip_all, fields(source_id = %source_id, provider = %provider))]
pub async fn receive_event(
    State(state): State<AppState>,
    Path((source_id, provider)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let source_id = Uuid::parse_str(&source_id).map_err(|_| ApiError::NotFound("source"))?;
    let signature_name = signature_header(&provider).ok_or(ApiError::NotFound("provider"))?;

    let organization_id = header_str(&headers, ORGANIZATION_HEADER)
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| ApiError::BadRequest(format!("missing or malformed {ORGANIZATION_HEADER} header")))?;

    let is_json = header_str(&headers, header::CONTENT_TYPE.as_str())
        .is_some_and(|v| v.starts_with("application/json"));
    if !is_json {
        return Err(ApiError::BadRequest("content type must be application/json".into()));
    }

    let digest = header_str(&headers, signature_name)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {signature_name} header")))?;
    let digest = signature::parse_header(digest)
        .map_err(|e| ApiError::BadRequest(format!("{signature_name}: {e}")))?;

    let source = match state.store.find_event_source(source_id).await {
        Ok(source) => source,
        Err(DbError::NotFound) => return Err(ApiError::NotFound("source")),
        Err(err) => return Err(err.into()),
    };
    let canvas = state.store.find_canvas(source.canvas_id).await?;
    if canvas.organization_id != organization_id {
        return Err(ApiError::NotFound("source"));
    }

    let body = read_capped(&headers, body, MAX_EVENT_SIZE).await?;

    let key = source_key(state.encryptor.as_ref(), &source)?;
    if signature::verify(&key, &body, &digest).is_err() {
        warn!("invalid signature");
        return Err(ApiError::InvalidSignature);
    }

    let event = state
        .store
        .create_raw_event(NewRawEvent {
            source_id: source.id,
            source_name: source.name.clone(),
            source_type: SourceType::EventSource,
            raw: body.to_vec(),
            headers: stored_headers(&headers),
        })
        .await?;

    info!(event_id = %event.id, canvas_id = %canvas.id, "event received");
    Ok(StatusCode::OK)
}

/// Header names (already lowercase) mapped to their first value.
fn stored_headers(headers: &HeaderMap) -> Value {
    let map: Map<String, Value> = headers
        .keys()
        .filter_map(|name| {
            let value = headers.get(name)?.to_str().ok()?;
            Some((name.as_str().to_string(), Value::String(value.to_string())))
        })
        .collect();
    Value::Object(map)
}

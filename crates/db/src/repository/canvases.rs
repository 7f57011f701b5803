//! Canvas, event-source and secret repository functions.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use super::duplicate_as;
use crate::models::{CanvasRow, EventSourceRow, SecretRow};
use crate::store::{NewCanvas, NewEventSource, NewSecret};
use crate::DbError;

// ---------------------------------------------------------------------------
// canvases
// ---------------------------------------------------------------------------

pub async fn create_canvas(pool: &PgPool, new: NewCanvas) -> Result<CanvasRow, DbError> {
    sqlx::query_as::<_, CanvasRow>(
        r#"
        INSERT INTO canvases (id, organization_id, name, created_at)
        VALUES ($1, $2, $3, $4)
        RETURNING id, organization_id, name, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.organization_id)
    .bind(&new.name)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(duplicate_as("canvas"))
}

pub async fn find_canvas(pool: &PgPool, id: Uuid) -> Result<CanvasRow, DbError> {
    sqlx::query_as::<_, CanvasRow>(
        "SELECT id, organization_id, name, created_at FROM canvases WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

// ---------------------------------------------------------------------------
// event_sources
// ---------------------------------------------------------------------------

pub async fn create_event_source(
    pool: &PgPool,
    new: NewEventSource,
) -> Result<EventSourceRow, DbError> {
    sqlx::query_as::<_, EventSourceRow>(
        r#"
        INSERT INTO event_sources (id, canvas_id, name, key, created_at)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, canvas_id, name, key, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.canvas_id)
    .bind(&new.name)
    .bind(&new.key)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(duplicate_as("event source"))
}

pub async fn find_event_source(pool: &PgPool, id: Uuid) -> Result<EventSourceRow, DbError> {
    sqlx::query_as::<_, EventSourceRow>(
        "SELECT id, canvas_id, name, key, created_at FROM event_sources WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

// ---------------------------------------------------------------------------
// secrets
// ---------------------------------------------------------------------------

pub async fn create_secret(pool: &PgPool, new: NewSecret) -> Result<SecretRow, DbError> {
    sqlx::query_as::<_, SecretRow>(
        r#"
        INSERT INTO secrets (id, canvas_id, name, provider, data, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, canvas_id, name, provider, data, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.canvas_id)
    .bind(&new.name)
    .bind(&new.provider)
    .bind(&new.data)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(duplicate_as("secret"))
}

pub async fn find_secret_by_name(
    pool: &PgPool,
    canvas_id: Uuid,
    name: &str,
) -> Result<SecretRow, DbError> {
    sqlx::query_as::<_, SecretRow>(
        r#"
        SELECT id, canvas_id, name, provider, data, created_at
        FROM secrets
        WHERE canvas_id = $1 AND name = $2
        "#,
    )
    .bind(canvas_id)
    .bind(name)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)
}

//! Stage repository functions.

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use super::duplicate_as;
use crate::models::{SourceType, StageRow};
use crate::store::NewStage;
use crate::DbError;

pub async fn create_stage(pool: &PgPool, new: NewStage) -> Result<StageRow, DbError> {
    sqlx::query_as::<_, StageRow>(
        r#"
        INSERT INTO stages
            (id, canvas_id, name, conditions, connections, inputs, input_mappings,
             outputs, secrets, tags, executor_spec, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.canvas_id)
    .bind(&new.name)
    .bind(&new.conditions)
    .bind(&new.connections)
    .bind(&new.inputs)
    .bind(&new.input_mappings)
    .bind(&new.outputs)
    .bind(&new.secrets)
    .bind(&new.tags)
    .bind(&new.executor_spec)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(duplicate_as("stage"))
}

pub async fn find_stage(pool: &PgPool, id: Uuid) -> Result<StageRow, DbError> {
    sqlx::query_as::<_, StageRow>("SELECT * FROM stages WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

/// Uses JSONB containment on the `connections` array, served by the GIN
/// index on that column.
pub async fn list_stages_connected_to(
    pool: &PgPool,
    source_id: Uuid,
    source_type: SourceType,
) -> Result<Vec<StageRow>, DbError> {
    let probe = json!([{ "source_id": source_id, "source_type": source_type.as_str() }]);
    let rows = sqlx::query_as::<_, StageRow>(
        "SELECT * FROM stages WHERE connections @> $1 ORDER BY created_at ASC",
    )
    .bind(probe)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

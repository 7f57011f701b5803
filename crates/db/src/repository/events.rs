//! Raw event repository functions, including the router's commit.
//!
//! The router claims a raw event with `SELECT … FOR UPDATE SKIP LOCKED`
//! inside the same transaction that writes its stage-events, so a raw event
//! is routed by at most one worker and never re-enters `pending`.

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::{stage_events, text_column};
use crate::models::{RawEventRow, RawEventState, SourceType, StageEventRow};
use crate::store::{NewRawEvent, RoutingOutcome};
use crate::DbError;

impl<'r> FromRow<'r, PgRow> for RawEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            source_id: row.try_get("source_id")?,
            source_name: row.try_get("source_name")?,
            source_type: text_column(row, "source_type")?,
            raw: row.try_get("raw")?,
            headers: row.try_get("headers")?,
            state: text_column(row, "state")?,
            received_at: row.try_get("received_at")?,
        })
    }
}

pub async fn create_raw_event(pool: &PgPool, new: NewRawEvent) -> Result<RawEventRow, DbError> {
    let mut conn = pool.acquire().await?;
    insert_raw_event(&mut conn, new).await
}

pub(crate) async fn insert_raw_event(
    conn: &mut PgConnection,
    new: NewRawEvent,
) -> Result<RawEventRow, DbError> {
    let row = sqlx::query_as::<_, RawEventRow>(
        r#"
        INSERT INTO raw_events
            (id, source_id, source_name, source_type, raw, headers, state, received_at)
        VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(new.source_id)
    .bind(&new.source_name)
    .bind(new.source_type.as_str())
    .bind(&new.raw)
    .bind(&new.headers)
    .bind(Utc::now())
    .fetch_one(conn)
    .await?;
    Ok(row)
}

pub async fn find_raw_event(pool: &PgPool, id: Uuid) -> Result<RawEventRow, DbError> {
    sqlx::query_as::<_, RawEventRow>("SELECT * FROM raw_events WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn list_raw_events(
    pool: &PgPool,
    state: RawEventState,
    limit: i64,
) -> Result<Vec<RawEventRow>, DbError> {
    let rows = sqlx::query_as::<_, RawEventRow>(
        r#"
        SELECT * FROM raw_events
        WHERE state = $1
        ORDER BY received_at ASC
        LIMIT $2
        "#,
    )
    .bind(state.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn latest_raw_event_for_source(
    pool: &PgPool,
    source_id: Uuid,
    source_type: SourceType,
) -> Result<Option<RawEventRow>, DbError> {
    let row = sqlx::query_as::<_, RawEventRow>(
        r#"
        SELECT * FROM raw_events
        WHERE source_id = $1 AND source_type = $2
        ORDER BY received_at DESC
        LIMIT 1
        "#,
    )
    .bind(source_id)
    .bind(source_type.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Claim the raw event, write every planned stage-event, and move the raw
/// event to its terminal state, all in one transaction.
pub async fn commit_routing(
    pool: &PgPool,
    raw_event_id: Uuid,
    outcome: RoutingOutcome,
) -> Result<Option<Vec<StageEventRow>>, DbError> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query_as::<_, RawEventRow>(
        r#"
        SELECT * FROM raw_events
        WHERE id = $1 AND state = 'pending'
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(raw_event_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(raw_event) = claimed else {
        debug!(%raw_event_id, "raw event already claimed or routed");
        tx.rollback().await?;
        return Ok(None);
    };

    let (final_state, plans) = match outcome {
        RoutingOutcome::Discarded => (RawEventState::Discarded, Vec::new()),
        RoutingOutcome::Processed(plans) => (RawEventState::Processed, plans),
    };

    let mut created = Vec::with_capacity(plans.len());
    for plan in plans {
        created.push(stage_events::insert_stage_event(&mut *tx, &raw_event, plan).await?);
    }

    sqlx::query("UPDATE raw_events SET state = $1 WHERE id = $2")
        .bind(final_state.as_str())
        .bind(raw_event_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(Some(created))
}

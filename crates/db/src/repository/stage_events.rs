//! Stage-event, tag and approval repository functions.

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Row};
use uuid::Uuid;

use super::{optional_text_column, text_column};
use crate::models::{
    ApprovalRow, RawEventRow, StageEventRow, StageEventStateReason,
    StageEventStatus, StageEventTagRow, TagState,
};
use crate::store::{NewStageEvent, PageCursor};
use crate::DbError;

impl<'r> FromRow<'r, PgRow> for StageEventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            stage_id: row.try_get("stage_id")?,
            source_id: row.try_get("source_id")?,
            source_name: row.try_get("source_name")?,
            source_type: text_column(row, "source_type")?,
            raw_event_id: row.try_get("raw_event_id")?,
            inputs: row.try_get("inputs")?,
            state: text_column(row, "state")?,
            state_reason: optional_text_column(row, "state_reason")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for StageEventTagRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            stage_event_id: row.try_get("stage_event_id")?,
            name: row.try_get("name")?,
            value: row.try_get("value")?,
            state: text_column(row, "state")?,
        })
    }
}

fn reason_text(reason: Option<StageEventStateReason>) -> Option<&'static str> {
    reason.map(|r| r.as_str())
}

// ---------------------------------------------------------------------------
// stage_events
// ---------------------------------------------------------------------------

/// Insert one planned stage-event (and its tags), cancelling the
/// `waiting / connection` events it supersedes.
pub(crate) async fn insert_stage_event(
    conn: &mut PgConnection,
    raw_event: &RawEventRow,
    plan: NewStageEvent,
) -> Result<StageEventRow, DbError> {
    if !plan.cancels.is_empty() {
        sqlx::query(
            r#"
            UPDATE stage_events
            SET state = 'processed', state_reason = 'cancelled'
            WHERE id = ANY($1) AND stage_id = $2
              AND state = 'waiting' AND state_reason = 'connection'
            "#,
        )
        .bind(&plan.cancels)
        .bind(plan.stage_id)
        .execute(&mut *conn)
        .await?;
    }

    let row = sqlx::query_as::<_, StageEventRow>(
        r#"
        INSERT INTO stage_events
            (id, stage_id, source_id, source_name, source_type, raw_event_id,
             inputs, state, state_reason, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(plan.stage_id)
    .bind(raw_event.source_id)
    .bind(&raw_event.source_name)
    .bind(raw_event.source_type.as_str())
    .bind(raw_event.id)
    .bind(&plan.inputs)
    .bind(plan.state.as_str())
    .bind(reason_text(plan.state_reason))
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;

    for (name, value) in &plan.tags {
        sqlx::query(
            r#"
            INSERT INTO stage_event_tags (stage_event_id, name, value, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stage_event_id, name) DO NOTHING
            "#,
        )
        .bind(row.id)
        .bind(name)
        .bind(value)
        .bind(TagState::Unknown.as_str())
        .execute(&mut *conn)
        .await?;
    }

    Ok(row)
}

pub async fn find_stage_event(pool: &PgPool, id: Uuid) -> Result<StageEventRow, DbError> {
    sqlx::query_as::<_, StageEventRow>("SELECT * FROM stage_events WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(DbError::NotFound)
}

pub async fn list_stage_events_for_stage(
    pool: &PgPool,
    stage_id: Uuid,
) -> Result<Vec<StageEventRow>, DbError> {
    let rows = sqlx::query_as::<_, StageEventRow>(
        "SELECT * FROM stage_events WHERE stage_id = $1 ORDER BY created_at ASC",
    )
    .bind(stage_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_stage_events(
    pool: &PgPool,
    stage_id: Option<Uuid>,
    (state, reason): StageEventStatus,
    after: Option<PageCursor>,
    limit: i64,
) -> Result<Vec<StageEventRow>, DbError> {
    let rows = sqlx::query_as::<_, StageEventRow>(
        r#"
        SELECT * FROM stage_events
        WHERE state = $1
          AND state_reason IS NOT DISTINCT FROM $2
          AND ($3::uuid IS NULL OR stage_id = $3)
          AND ($4::timestamptz IS NULL OR (created_at, id) > ($4, $5))
        ORDER BY created_at ASC, id ASC
        LIMIT $6
        "#,
    )
    .bind(state.as_str())
    .bind(reason_text(reason))
    .bind(stage_id)
    .bind(after.map(|(created_at, _)| created_at))
    .bind(after.map(|(_, id)| id))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn stages_with_pending_events(pool: &PgPool) -> Result<Vec<Uuid>, DbError> {
    let ids = sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT stage_id FROM stage_events
        WHERE state = 'pending'
        GROUP BY stage_id
        ORDER BY MIN(created_at) ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

pub async fn oldest_pending_stage_event(
    pool: &PgPool,
    stage_id: Uuid,
) -> Result<Option<StageEventRow>, DbError> {
    let row = sqlx::query_as::<_, StageEventRow>(
        r#"
        SELECT * FROM stage_events
        WHERE stage_id = $1 AND state = 'pending'
        ORDER BY created_at ASC
        LIMIT 1
        "#,
    )
    .bind(stage_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn transition_stage_event(
    pool: &PgPool,
    id: Uuid,
    (from_state, from_reason): StageEventStatus,
    (to_state, to_reason): StageEventStatus,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"
        UPDATE stage_events
        SET state = $1, state_reason = $2
        WHERE id = $3 AND state = $4 AND state_reason IS NOT DISTINCT FROM $5
        "#,
    )
    .bind(to_state.as_str())
    .bind(reason_text(to_reason))
    .bind(id)
    .bind(from_state.as_str())
    .bind(reason_text(from_reason))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// stage_event_tags
// ---------------------------------------------------------------------------

pub async fn list_stage_event_tags(
    pool: &PgPool,
    stage_event_id: Uuid,
) -> Result<Vec<StageEventTagRow>, DbError> {
    let rows = sqlx::query_as::<_, StageEventTagRow>(
        "SELECT * FROM stage_event_tags WHERE stage_event_id = $1 ORDER BY name ASC",
    )
    .bind(stage_event_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Set every tag of a stage-event to `state`, inserting `extra` tags first.
pub(crate) async fn flip_tags(
    conn: &mut PgConnection,
    stage_event_id: Uuid,
    extra: &std::collections::BTreeMap<String, String>,
    state: TagState,
) -> Result<(), DbError> {
    for (name, value) in extra {
        sqlx::query(
            r#"
            INSERT INTO stage_event_tags (stage_event_id, name, value, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stage_event_id, name) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(stage_event_id)
        .bind(name)
        .bind(value)
        .bind(state.as_str())
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query("UPDATE stage_event_tags SET state = $1 WHERE stage_event_id = $2")
        .bind(state.as_str())
        .bind(stage_event_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// approvals
// ---------------------------------------------------------------------------

pub async fn create_approval(
    pool: &PgPool,
    stage_event_id: Uuid,
    requester_id: Uuid,
) -> Result<ApprovalRow, DbError> {
    sqlx::query_as::<_, ApprovalRow>(
        r#"
        INSERT INTO approvals (id, stage_event_id, requester_id, approved_at)
        VALUES ($1, $2, $3, $4)
        RETURNING id, stage_event_id, requester_id, approved_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(stage_event_id)
    .bind(requester_id)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .map_err(|err| match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => DbError::AlreadyApproved,
        _ => DbError::Sqlx(err),
    })
}

pub async fn count_approvals(pool: &PgPool, stage_event_id: Uuid) -> Result<i64, DbError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM approvals WHERE stage_event_id = $1",
    )
    .bind(stage_event_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use uuid::Uuid;

use super::rows::{EVENT_COLUMNS, event_from_row};
use super::runs::lock_run;
use super::{PgResultExt, PgStore};
use crate::core::error::{Error, Result, ResultExt};
use crate::core::model::{EventPayload, Page, RunEvent};
use crate::core::store::{EventRepo, next_emitted_at};

/// Append `payloads` with consecutive sequence numbers. The caller must
/// already hold the run row lock (`lock_run`) in the same transaction.
pub(super) async fn append_events(
    conn: &mut PgConnection,
    run_id: Uuid,
    payloads: &[EventPayload],
    now: DateTime<Utc>,
) -> Result<Vec<RunEvent>> {
    if payloads.is_empty() {
        return Ok(Vec::new());
    }
    let (max_seq, mut last): (Option<i64>, Option<DateTime<Utc>>) =
        sqlx::query_as("SELECT MAX(seq), MAX(emitted_at) FROM run_events WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&mut *conn)
            .await
            .pg()?;
    let mut seq = max_seq.unwrap_or(0);

    let mut out = Vec::with_capacity(payloads.len());
    for payload in payloads {
        seq += 1;
        let emitted_at = next_emitted_at(now, last);
        let (event_type, body) = payload.to_columns()?;
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO run_events (run_id, seq, event_type, payload, emitted_at)
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(run_id)
        .bind(seq)
        .bind(&event_type)
        .bind(body)
        .bind(emitted_at)
        .fetch_one(&mut *conn)
        .await
        .pg()?;
        out.push(RunEvent {
            id,
            run_id,
            seq,
            payload: payload.clone(),
            emitted_at,
        });
        last = Some(emitted_at);
    }
    Ok(out)
}

#[async_trait]
impl EventRepo for PgStore {
    async fn append_event(&self, run_id: Uuid, payload: EventPayload) -> Result<RunEvent> {
        let res: Result<RunEvent> = async {
            let mut tx = self.pool.begin().await.pg()?;
            lock_run(&mut tx, run_id).await?;
            let mut events =
                append_events(&mut tx, run_id, std::slice::from_ref(&payload), Utc::now()).await?;
            tx.commit().await.pg()?;
            events
                .pop()
                .ok_or_else(|| Error::internal("event was not recorded"))
        }
        .await;
        res.op_context("append", "event", Some(run_id.to_string()))
    }

    async fn list_events(
        &self,
        run_id: Uuid,
        after_seq: Option<i64>,
        page: Page,
    ) -> Result<Vec<RunEvent>> {
        let (limit, offset) = page.resolve()?;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM run_events WHERE run_id = $1 AND seq > $2 ORDER BY seq ASC LIMIT $3 OFFSET $4",
            EVENT_COLUMNS
        ))
        .bind(run_id)
        .bind(after_seq.unwrap_or(0))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .pg()
        .op_context("list", "event", Some(run_id.to_string()))?;
        rows.iter().map(event_from_row).collect()
    }
}

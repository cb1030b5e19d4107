use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use uuid::Uuid;

use super::rows::{EVENT_COLUMNS, collect, event_from_row};
use super::{SqlResultExt, SqliteStore};
use crate::core::error::{Result, ResultExt};
use crate::core::model::{EventPayload, Page, RunEvent};
use crate::core::store::codec::{decode_opt_ts, encode_ts};
use crate::core::store::{EventRepo, next_emitted_at};

/// Append `payloads` with consecutive sequence numbers. Callers run this
/// inside an IMMEDIATE transaction, which already holds SQLite's single
/// write lock for the duration of the max-then-insert.
pub(super) fn append_events(
    conn: &Connection,
    run_id: Uuid,
    payloads: &[EventPayload],
    now: DateTime<Utc>,
) -> Result<Vec<RunEvent>> {
    if payloads.is_empty() {
        return Ok(Vec::new());
    }
    let (max_seq, last_at): (Option<i64>, Option<String>) = conn
        .query_row(
            "SELECT MAX(seq), MAX(emitted_at) FROM run_events WHERE run_id = ?1",
            params![run_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .sql()?;
    let mut seq = max_seq.unwrap_or(0);
    let mut last = decode_opt_ts("emitted_at", last_at.as_deref())?;

    let mut out = Vec::with_capacity(payloads.len());
    for payload in payloads {
        seq += 1;
        let emitted_at = next_emitted_at(now, last);
        let (event_type, body) = payload.to_columns()?;
        conn.execute(
            "INSERT INTO run_events (run_id, seq, event_type, payload, emitted_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id.to_string(),
                seq,
                event_type,
                serde_json::to_string(&body)?,
                encode_ts(&emitted_at)
            ],
        )
        .sql()?;
        out.push(RunEvent {
            id: conn.last_insert_rowid(),
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
impl EventRepo for SqliteStore {
    async fn append_event(&self, run_id: Uuid, payload: EventPayload) -> Result<RunEvent> {
        self.with_tx(move |conn| {
            super::runs::load_run(conn, run_id)?;
            let mut events = append_events(conn, run_id, std::slice::from_ref(&payload), Utc::now())?;
            events
                .pop()
                .ok_or_else(|| crate::core::error::Error::internal("event was not recorded"))
        })
        .await
        .op_context("append", "event", Some(run_id.to_string()))
    }

    async fn list_events(
        &self,
        run_id: Uuid,
        after_seq: Option<i64>,
        page: Page,
    ) -> Result<Vec<RunEvent>> {
        let (limit, offset) = page.resolve()?;
        let after = after_seq.unwrap_or(0);
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM run_events WHERE run_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3 OFFSET ?4",
                    EVENT_COLUMNS
                ))
                .sql()?;
            collect(
                &mut stmt,
                params![run_id.to_string(), after, limit, offset],
                event_from_row,
            )
        })
        .await
        .op_context("list", "event", Some(run_id.to_string()))
    }
}

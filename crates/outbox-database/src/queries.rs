//! Outbox store queries.
//!
//! Standalone functions that take a `&Connection` as their first parameter, so
//! they run equally well on a caller's open transaction (a `Transaction`
//! derefs to `Connection`) or inside `AsyncDatabase::call`.
//!
//! Nothing here commits on its own: the enclosing transaction, if any,
//! decides atomicity. Functions that depend on the clock take `now`
//! explicitly.

use crate::{DatabaseResult, EventRecord, NewEventRecord};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};

/// Upper bound on ids bound into a single `IN (...)` statement.
const MAX_IDS_PER_STATEMENT: usize = 500;

const EVENT_COLUMNS: &str = "id, aggregate_id, aggregate_type, event_type, event_version, payload,
     correlation_id, causation_id, user_id, topic, partition_key, processed, processed_at,
     retry_count, error_message, created_at, updated_at";

// ==========================================
// Inserts
// ==========================================

/// Insert a single outbox record.
pub fn insert_event_record(
    conn: &Connection,
    record: &NewEventRecord,
    now: DateTime<Utc>,
) -> DatabaseResult<()> {
    insert_event_records(conn, std::slice::from_ref(record), now).map(|_| ())
}

/// Insert a batch of outbox records, all stamped with the same `now`.
///
/// Rows within the batch keep their slice order through `rowid`.
pub fn insert_event_records(
    conn: &Connection,
    records: &[NewEventRecord],
    now: DateTime<Utc>,
) -> DatabaseResult<usize> {
    if records.is_empty() {
        return Ok(0);
    }
    let now = format_timestamp(now);
    let mut stmt = conn.prepare_cached(
        "INSERT INTO outbox_events (id, aggregate_id, aggregate_type, event_type, event_version, payload,
             correlation_id, causation_id, user_id, topic, partition_key, processed, retry_count,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, 0, ?12, ?12)",
    )?;

    for record in records {
        stmt.execute(params![
            record.id,
            record.aggregate_id,
            record.aggregate_type,
            record.event_type,
            record.event_version,
            record.payload,
            record.correlation_id,
            record.causation_id,
            record.user_id,
            record.topic,
            record.partition_key,
            now,
        ])?;
    }
    Ok(records.len())
}

// ==========================================
// Reads
// ==========================================

/// Get an outbox record by ID.
pub fn get_event_record(conn: &Connection, id: &str) -> DatabaseResult<Option<EventRecord>> {
    let sql = format!("SELECT {} FROM outbox_events WHERE id = ?1", EVENT_COLUMNS);
    let mut stmt = conn.prepare_cached(&sql)?;

    match stmt.query_row(params![id], map_event_record) {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Select the records that are due for dispatch, oldest first.
///
/// A record is due when it is unprocessed and either has never been tried,
/// or is below the retry ceiling and its last failure is at least
/// `retry_delay` old.
pub fn select_ready(
    conn: &Connection,
    batch_size: usize,
    max_retries: i32,
    retry_delay: Duration,
    now: DateTime<Utc>,
) -> DatabaseResult<Vec<EventRecord>> {
    let retry_cutoff = format_timestamp(now - retry_delay);
    let sql = format!(
        "SELECT {} FROM outbox_events
         WHERE processed = 0
           AND (retry_count = 0 OR (retry_count < ?1 AND updated_at <= ?2))
         ORDER BY created_at ASC, rowid ASC
         LIMIT ?3",
        EVENT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    let records = stmt
        .query_map(
            params![max_retries, retry_cutoff, batch_size as i64],
            map_event_record,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

/// List records that reached the retry ceiling without being published.
pub fn list_exhausted(
    conn: &Connection,
    max_retries: i32,
    limit: usize,
) -> DatabaseResult<Vec<EventRecord>> {
    let sql = format!(
        "SELECT {} FROM outbox_events
         WHERE processed = 0 AND retry_count >= ?1
         ORDER BY created_at ASC, rowid ASC
         LIMIT ?2",
        EVENT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    let records = stmt
        .query_map(params![max_retries, limit as i64], map_event_record)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

/// Count unprocessed records, exhausted ones included.
pub fn count_pending(conn: &Connection) -> DatabaseResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM outbox_events WHERE processed = 0",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Count unprocessed records at or above the retry ceiling.
pub fn count_exhausted(conn: &Connection, max_retries: i32) -> DatabaseResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM outbox_events WHERE processed = 0 AND retry_count >= ?1",
        params![max_retries],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Count published records still inside the retention window.
pub fn count_published(conn: &Connection) -> DatabaseResult<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM outbox_events WHERE processed = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ==========================================
// Updates
// ==========================================

/// Mark records as published.
///
/// Already-published rows are left untouched, so `processed_at` keeps its
/// first value. Returns the number of rows that changed.
pub fn mark_published(
    conn: &Connection,
    ids: &[String],
    now: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let now = format_timestamp(now);
    let mut updated = 0;

    for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
        let sql = format!(
            "UPDATE outbox_events
             SET processed = 1, processed_at = ?1, error_message = NULL, updated_at = ?1
             WHERE processed = 0 AND id IN ({})",
            placeholders(chunk.len())
        );

        let mut params_vec: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 1);
        params_vec.push(&now);
        for id in chunk {
            params_vec.push(id);
        }

        updated += conn.execute(&sql, params_vec.as_slice())?;
    }
    Ok(updated)
}

/// Record a failed dispatch attempt (increments retry count).
pub fn mark_failed(
    conn: &Connection,
    ids: &[String],
    reason: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let now = format_timestamp(now);
    let mut updated = 0;

    for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
        let sql = format!(
            "UPDATE outbox_events
             SET retry_count = retry_count + 1, error_message = ?1, updated_at = ?2
             WHERE processed = 0 AND id IN ({})",
            placeholders(chunk.len())
        );

        let mut params_vec: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 2);
        params_vec.push(&reason);
        params_vec.push(&now);
        for id in chunk {
            params_vec.push(id);
        }

        updated += conn.execute(&sql, params_vec.as_slice())?;
    }
    Ok(updated)
}

// ==========================================
// Deletes
// ==========================================

/// Permanently delete published records processed before `cutoff`.
///
/// Unprocessed rows are never matched, whatever their age.
pub fn delete_published_older_than(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let count = conn.execute(
        "DELETE FROM outbox_events
         WHERE processed = 1 AND processed_at IS NOT NULL AND processed_at < ?1",
        params![format_timestamp(cutoff)],
    )?;
    Ok(count)
}

// ==========================================
// Helpers
// ==========================================

fn map_event_record(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    Ok(EventRecord {
        id: row.get(0)?,
        aggregate_id: row.get(1)?,
        aggregate_type: row.get(2)?,
        event_type: row.get(3)?,
        event_version: row.get(4)?,
        payload: row.get(5)?,
        correlation_id: row.get(6)?,
        causation_id: row.get(7)?,
        user_id: row.get(8)?,
        topic: row.get(9)?,
        partition_key: row.get(10)?,
        processed: row.get(11)?,
        processed_at: row.get::<_, Option<String>>(12)?.map(parse_datetime),
        retry_count: row.get(13)?,
        error_message: row.get(14)?,
        created_at: parse_datetime(row.get::<_, String>(15)?),
        updated_at: parse_datetime(row.get::<_, String>(16)?),
    })
}

fn placeholders(count: usize) -> String {
    std::iter::repeat("?")
        .take(count)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Format a timestamp as fixed-width RFC 3339 (microseconds, `Z` suffix).
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC3339 datetime string, falling back to current time on error.
fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use chrono::TimeZone;

    fn create_test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn new_record(id: &str, topic: &str) -> NewEventRecord {
        NewEventRecord {
            id: id.to_string(),
            aggregate_id: format!("agg-{}", id),
            aggregate_type: "Order".to_string(),
            event_type: "OrderPlaced".to_string(),
            event_version: 1,
            payload: format!(r#"{{"id":"{}"}}"#, id),
            correlation_id: Some("corr-1".to_string()),
            causation_id: None,
            user_id: Some("user-7".to_string()),
            topic: topic.to_string(),
            partition_key: format!("agg-{}", id),
        }
    }

    fn ids(records: &[EventRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_insert_and_get_event_record() {
        let conn = create_test_conn();
        insert_event_record(&conn, &new_record("e1", "orders"), t0()).unwrap();

        let record = get_event_record(&conn, "e1").unwrap().unwrap();
        assert_eq!(record.aggregate_id, "agg-e1");
        assert_eq!(record.aggregate_type, "Order");
        assert_eq!(record.event_type, "OrderPlaced");
        assert_eq!(record.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(record.user_id.as_deref(), Some("user-7"));
        assert_eq!(record.topic, "orders");
        assert!(!record.processed);
        assert!(record.processed_at.is_none());
        assert_eq!(record.retry_count, 0);
        assert!(record.error_message.is_none());
        assert_eq!(record.created_at, t0());
        assert_eq!(record.updated_at, t0());

        assert!(get_event_record(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_insert_duplicate_id_fails() {
        let conn = create_test_conn();
        insert_event_record(&conn, &new_record("e1", "orders"), t0()).unwrap();
        assert!(insert_event_record(&conn, &new_record("e1", "orders"), t0()).is_err());
    }

    #[test]
    fn test_insert_empty_batch() {
        let conn = create_test_conn();
        assert_eq!(insert_event_records(&conn, &[], t0()).unwrap(), 0);
        assert_eq!(count_pending(&conn).unwrap(), 0);
    }

    #[test]
    fn test_select_ready_orders_by_created_at() {
        let conn = create_test_conn();
        insert_event_record(&conn, &new_record("late", "orders"), t0() + Duration::seconds(2)).unwrap();
        insert_event_record(&conn, &new_record("early", "orders"), t0()).unwrap();
        insert_event_records(
            &conn,
            &[new_record("mid-a", "orders"), new_record("mid-b", "payments")],
            t0() + Duration::seconds(1),
        )
        .unwrap();

        let ready = select_ready(&conn, 10, 3, Duration::seconds(30), t0() + Duration::seconds(5)).unwrap();
        assert_eq!(ids(&ready), vec!["early", "mid-a", "mid-b", "late"]);
    }

    #[test]
    fn test_select_ready_respects_batch_size() {
        let conn = create_test_conn();
        let records: Vec<_> = (0..15).map(|i| new_record(&format!("e{:02}", i), "orders")).collect();
        insert_event_records(&conn, &records, t0()).unwrap();

        let ready = select_ready(&conn, 10, 3, Duration::seconds(30), t0()).unwrap();
        assert_eq!(ready.len(), 10);
        assert_eq!(ready[0].id, "e00");
        assert_eq!(ready[9].id, "e09");
    }

    #[test]
    fn test_select_ready_honors_retry_delay() {
        let conn = create_test_conn();
        insert_event_record(&conn, &new_record("e1", "orders"), t0()).unwrap();

        let failed_at = t0() + Duration::seconds(1);
        mark_failed(&conn, &["e1".to_string()], "broker down", failed_at).unwrap();

        let too_soon = select_ready(&conn, 10, 3, Duration::seconds(30), failed_at + Duration::seconds(29)).unwrap();
        assert!(too_soon.is_empty());

        let due = select_ready(&conn, 10, 3, Duration::seconds(30), failed_at + Duration::seconds(30)).unwrap();
        assert_eq!(ids(&due), vec!["e1"]);
        assert_eq!(due[0].retry_count, 1);
    }

    #[test]
    fn test_select_ready_stops_at_retry_ceiling() {
        let conn = create_test_conn();
        insert_event_record(&conn, &new_record("e1", "orders"), t0()).unwrap();
        let id = vec!["e1".to_string()];

        mark_failed(&conn, &id, "first", t0()).unwrap();
        mark_failed(&conn, &id, "second", t0()).unwrap();

        let far_future = t0() + Duration::days(365);
        assert!(select_ready(&conn, 10, 2, Duration::seconds(1), far_future).unwrap().is_empty());
        assert_eq!(count_exhausted(&conn, 2).unwrap(), 1);
        assert_eq!(count_pending(&conn).unwrap(), 1);

        let exhausted = list_exhausted(&conn, 2, 10).unwrap();
        assert_eq!(ids(&exhausted), vec!["e1"]);
        assert_eq!(exhausted[0].error_message.as_deref(), Some("second"));
    }

    #[test]
    fn test_select_ready_skips_published() {
        let conn = create_test_conn();
        insert_event_records(&conn, &[new_record("e1", "orders"), new_record("e2", "orders")], t0()).unwrap();
        mark_published(&conn, &["e1".to_string()], t0()).unwrap();

        let ready = select_ready(&conn, 10, 3, Duration::seconds(30), t0()).unwrap();
        assert_eq!(ids(&ready), vec!["e2"]);
    }

    #[test]
    fn test_mark_published_sets_fields_and_clears_error() {
        let conn = create_test_conn();
        insert_event_record(&conn, &new_record("e1", "orders"), t0()).unwrap();
        mark_failed(&conn, &["e1".to_string()], "timeout", t0()).unwrap();

        let published_at = t0() + Duration::minutes(1);
        assert_eq!(mark_published(&conn, &["e1".to_string()], published_at).unwrap(), 1);

        let record = get_event_record(&conn, "e1").unwrap().unwrap();
        assert!(record.processed);
        assert_eq!(record.processed_at, Some(published_at));
        assert!(record.error_message.is_none());
        assert_eq!(record.retry_count, 1);
    }

    #[test]
    fn test_mark_published_is_idempotent() {
        let conn = create_test_conn();
        insert_event_record(&conn, &new_record("e1", "orders"), t0()).unwrap();
        let id = vec!["e1".to_string()];

        assert_eq!(mark_published(&conn, &id, t0()).unwrap(), 1);
        let first = get_event_record(&conn, "e1").unwrap().unwrap();

        assert_eq!(mark_published(&conn, &id, t0() + Duration::hours(1)).unwrap(), 0);
        let second = get_event_record(&conn, "e1").unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_mark_failed_increments_and_records_reason() {
        let conn = create_test_conn();
        insert_event_records(&conn, &[new_record("e1", "orders"), new_record("e2", "orders")], t0()).unwrap();
        let failed_at = t0() + Duration::seconds(3);

        let updated = mark_failed(&conn, &["e1".to_string(), "e2".to_string()], "broker unavailable", failed_at).unwrap();
        assert_eq!(updated, 2);

        let record = get_event_record(&conn, "e2").unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.error_message.as_deref(), Some("broker unavailable"));
        assert_eq!(record.updated_at, failed_at);
        assert!(!record.processed);
    }

    #[test]
    fn test_mark_failed_does_not_touch_published() {
        let conn = create_test_conn();
        insert_event_record(&conn, &new_record("e1", "orders"), t0()).unwrap();
        let id = vec!["e1".to_string()];
        mark_published(&conn, &id, t0()).unwrap();

        assert_eq!(mark_failed(&conn, &id, "late failure", t0()).unwrap(), 0);
        let record = get_event_record(&conn, "e1").unwrap().unwrap();
        assert_eq!(record.retry_count, 0);
        assert!(record.error_message.is_none());
    }

    #[test]
    fn test_updates_with_empty_ids_are_noops() {
        let conn = create_test_conn();
        assert_eq!(mark_published(&conn, &[], t0()).unwrap(), 0);
        assert_eq!(mark_failed(&conn, &[], "reason", t0()).unwrap(), 0);
    }

    #[test]
    fn test_mark_published_large_id_list() {
        let conn = create_test_conn();
        let records: Vec<_> = (0..1200).map(|i| new_record(&format!("e{}", i), "orders")).collect();
        insert_event_records(&conn, &records, t0()).unwrap();

        let all_ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        assert_eq!(mark_published(&conn, &all_ids, t0()).unwrap(), 1200);
        assert_eq!(count_pending(&conn).unwrap(), 0);
        assert_eq!(count_published(&conn).unwrap(), 1200);
    }

    #[test]
    fn test_delete_published_older_than_never_deletes_unprocessed() {
        let conn = create_test_conn();
        let ancient = t0() - Duration::days(400);
        insert_event_records(
            &conn,
            &[new_record("old-published", "orders"), new_record("old-pending", "orders")],
            ancient,
        )
        .unwrap();
        insert_event_record(&conn, &new_record("old-failed", "orders"), ancient).unwrap();
        mark_failed(&conn, &["old-failed".to_string()], "gone", ancient).unwrap();
        mark_published(&conn, &["old-published".to_string()], ancient).unwrap();

        let deleted = delete_published_older_than(&conn, t0() + Duration::days(365)).unwrap();
        assert_eq!(deleted, 1);

        assert!(get_event_record(&conn, "old-published").unwrap().is_none());
        assert!(get_event_record(&conn, "old-pending").unwrap().is_some());
        assert!(get_event_record(&conn, "old-failed").unwrap().is_some());
    }

    #[test]
    fn test_delete_published_keeps_rows_inside_retention() {
        let conn = create_test_conn();
        insert_event_records(&conn, &[new_record("e1", "orders"), new_record("e2", "orders")], t0()).unwrap();
        mark_published(&conn, &["e1".to_string()], t0() - Duration::hours(30)).unwrap();
        mark_published(&conn, &["e2".to_string()], t0() - Duration::hours(1)).unwrap();

        let deleted = delete_published_older_than(&conn, t0() - Duration::hours(24)).unwrap();
        assert_eq!(deleted, 1);
        assert!(get_event_record(&conn, "e1").unwrap().is_none());
        assert!(get_event_record(&conn, "e2").unwrap().is_some());
    }

    #[test]
    fn test_format_timestamp_is_fixed_width() {
        let whole = format_timestamp(t0());
        let fractional = format_timestamp(t0() + Duration::microseconds(1));
        assert_eq!(whole, "2026-01-01T12:00:00.000000Z");
        assert_eq!(whole.len(), fractional.len());
        assert!(whole < fractional);
    }
}

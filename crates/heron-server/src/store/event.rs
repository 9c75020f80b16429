//! Append-only event log.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use super::Result;

/// Event severity. The numeric order matters: filters select events at or
/// above a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info = 0,
    Warn = 1,
    Error = 2,
}

impl Level {
    pub fn from_i64(value: i64) -> Level {
        match value {
            2 => Level::Error,
            1 => Level::Warn,
            _ => Level::Info,
        }
    }
}

/// Relations that allow filtering the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relations {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub level: Level,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(flatten)]
    pub relations: Relations,
}

fn event_from_row(row: &Row) -> rusqlite::Result<Event> {
    let level: i64 = row.get("level")?;
    Ok(Event {
        id: row.get("id")?,
        created_at: row.get("created_at")?,
        level: Level::from_i64(level),
        text: row.get("text")?,
        details: row.get("details")?,
        relations: Relations {
            machine_id: row.get("machine_id")?,
            app_id: row.get("app_id")?,
            daemon_id: row.get("daemon_id")?,
            subnet_id: row.get("subnet_id")?,
            user_id: row.get("user_id")?,
        },
    })
}

const EVENT_COLUMNS: &str =
    "id, created_at, level, text, details, machine_id, app_id, daemon_id, subnet_id, user_id";

pub fn add(
    conn: &Connection,
    level: Level,
    text: &str,
    details: Option<&str>,
    relations: Relations,
) -> Result<Event> {
    conn.execute(
        "INSERT INTO event (created_at, level, text, details, machine_id, app_id, daemon_id, \
         subnet_id, user_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            Utc::now(),
            level as i64,
            text,
            details,
            relations.machine_id,
            relations.app_id,
            relations.daemon_id,
            relations.subnet_id,
            relations.user_id,
        ],
    )?;
    let id = conn.last_insert_rowid();
    let event = conn.query_row(
        &format!("SELECT {EVENT_COLUMNS} FROM event WHERE id = ?1"),
        [id],
        event_from_row,
    )?;
    Ok(event)
}

/// Newest-first listing with optional filters.
pub fn list(
    conn: &Connection,
    offset: i64,
    limit: i64,
    machine_id: Option<i64>,
    min_level: Option<Level>,
) -> Result<(Vec<Event>, i64)> {
    let mut filters = vec!["1 = 1".to_string()];
    if let Some(machine_id) = machine_id {
        filters.push(format!("machine_id = {machine_id}"));
    }
    if let Some(level) = min_level {
        filters.push(format!("level >= {}", level as i64));
    }
    let where_clause = filters.join(" AND ");

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM event WHERE {where_clause}"),
        [],
        |row| row.get(0),
    )?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM event WHERE {where_clause} \
         ORDER BY id DESC LIMIT ?1 OFFSET ?2"
    ))?;
    let events = stmt
        .query_map(params![limit, offset], event_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok((events, total))
}

/// Events with id greater than `after_id`, oldest first (SSE resume).
pub fn list_after(conn: &Connection, after_id: i64, limit: i64) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM event WHERE id > ?1 ORDER BY id LIMIT ?2"
    ))?;
    let result = stmt
        .query_map(params![after_id, limit], event_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(result)
}

/// Drop events beyond the retention window, keeping the newest `keep`.
pub fn trim(conn: &Connection, keep: i64) -> Result<u64> {
    let deleted = conn.execute(
        "DELETE FROM event WHERE id NOT IN (SELECT id FROM event ORDER BY id DESC LIMIT ?1)",
        [keep],
    )?;
    Ok(deleted as u64)
}

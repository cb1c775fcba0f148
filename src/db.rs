use crate::types::PlateMatch;
use log::error;
use rusqlite::{params, Connection, Result, NO_PARAMS};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn open(path: &str) -> Connection {
    let conn = Connection::open(path).expect("Unable to open db");
    conn.execute(
        "CREATE TABLE IF NOT EXISTS scan_match (
            plate TEXT NOT NULL,
            kind TEXT NOT NULL,
            appointment_id TEXT,
            owner_name TEXT,
            confidence REAL NOT NULL,
            timestamp REAL NOT NULL
        )",
        NO_PARAMS,
    )
    .expect("Unable to create scan_match table");
    conn
}

/// Appends a confirmed match; returns how many times the plate has matched
/// before.
pub fn record_match(conn: &Connection, plate_match: &PlateMatch) -> u32 {
    match record_match_impl(conn, plate_match) {
        Ok(n) => n,
        Err(e) => {
            error!(
                "Error recording match for plate {}: {:?}",
                plate_match.candidate.plate, e
            );
            0
        }
    }
}

fn record_match_impl(conn: &Connection, plate_match: &PlateMatch) -> Result<u32> {
    let plate = &plate_match.candidate.plate;
    let previous: u32 = conn.query_row(
        "SELECT COUNT(*) FROM scan_match WHERE plate = ?1",
        params![plate],
        |row| row.get(0),
    )?;
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    conn.execute(
        "INSERT INTO scan_match(plate, kind, appointment_id, owner_name, confidence, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            plate,
            plate_match.kind.as_str(),
            plate_match.record.appointment_id,
            plate_match.record.owner_name,
            plate_match.candidate.confidence,
            timestamp
        ],
    )?;
    Ok(previous)
}

/// Most recent matches first, as JSON rows.
pub fn recent_matches(conn: &Connection, limit: u32) -> Vec<Value> {
    match recent_matches_impl(conn, limit) {
        Ok(rows) => rows,
        Err(e) => {
            error!("Error reading match history: {:?}", e);
            Vec::new()
        }
    }
}

fn recent_matches_impl(conn: &Connection, limit: u32) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT plate, kind, appointment_id, owner_name, confidence, timestamp
         FROM scan_match ORDER BY timestamp DESC, rowid DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(json!({
            "plate": row.get::<_, String>(0)?,
            "kind": row.get::<_, String>(1)?,
            "appointmentId": row.get::<_, Option<String>>(2)?,
            "ownerName": row.get::<_, Option<String>>(3)?,
            "confidence": row.get::<_, f64>(4)?,
            "timestamp": row.get::<_, f64>(5)?,
        }))
    })?;
    rows.collect()
}

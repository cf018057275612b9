use crate::errors::{JournalError, JournalResult};
use crate::state::DbCommand;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type DbPool = Arc<Mutex<Connection>>;

const SCHEMA: &str = include_str!("../migrations/001_init.sql");

pub fn init_db(data_dir: &Path) -> JournalResult<DbPool> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("factor_journal.db");
    let conn = Connection::open(&db_path)?;

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("database initialized at {}", db_path.display());
    Ok(Arc::new(Mutex::new(conn)))
}

/// Dedicated DB writer task. Reads commands from bounded channel, executes SQL.
/// This is the ONLY task that writes through the connection.
pub async fn run_db_writer(db: DbPool, mut rx: mpsc::Receiver<DbCommand>) {
    tracing::info!("db writer task started");

    while let Some(cmd) = rx.recv().await {
        if let Err(e) = execute_command(&db, cmd) {
            tracing::error!("db write error: {e}");
        }
    }

    tracing::info!("db writer task shutting down");
}

fn execute_command(db: &DbPool, cmd: DbCommand) -> JournalResult<()> {
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock poisoned: {e}")))?;

    match cmd {
        DbCommand::SaveSection { section, payload, updated_at } => {
            save_section(&conn, section.as_str(), &payload, &updated_at)?;
            tracing::debug!(section = %section, bytes = payload.len(), "section saved");
        }
    }
    Ok(())
}

fn save_section(conn: &Connection, section: &str, payload: &str, updated_at: &str) -> JournalResult<()> {
    conn.execute(
        "INSERT INTO journal_sections (section, payload, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(section) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        rusqlite::params![section, payload, updated_at],
    )?;
    Ok(())
}

/// Read every persisted section at startup (before the writer task runs).
pub fn load_sections(db: &DbPool) -> JournalResult<HashMap<String, String>> {
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock: {e}")))?;
    load_sections_inner(&conn)
}

fn load_sections_inner(conn: &Connection) -> JournalResult<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT section, payload FROM journal_sections")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    let mut sections = HashMap::new();
    for row in rows {
        let (section, payload) = row?;
        sections.insert(section, payload);
    }
    Ok(sections)
}

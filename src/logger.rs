//! Process-wide structured logger.
//!
//! Log calls never block the request path: each call pushes onto an `mpsc`
//! channel and a background thread batches inserts into SQLite (flushed
//! every 100 messages or every second, whichever comes first).

use dirs::data_dir;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{mpsc, Once, RwLock};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();
static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);

#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: i64,
    level: String,
    source: String,
    message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }
}

static MIN_LEVEL: RwLock<LogLevel> = RwLock::new(LogLevel::Info);

/// Sets the process-wide minimum level below which calls to [`debug`],
/// [`info`], [`warn`] and [`error`] are dropped before ever reaching the
/// batch writer. Read from `Settings.log_level` at startup.
pub fn set_min_level(level: LogLevel) {
    *MIN_LEVEL.write().unwrap() = level;
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: i64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub level: Option<LogLevel>,
    pub source: Option<String>,
}

fn db_path() -> PathBuf {
    if let Ok(p) = std::env::var("GATEWAY_LOG_DB_PATH") {
        return PathBuf::from(p);
    }
    let mut p = data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("llm-gateway");
    std::fs::create_dir_all(&p).ok();
    p.push("gateway.db");
    p
}

fn open_conn() -> Connection {
    Connection::open(db_path()).unwrap()
}

pub fn init() {
    INIT.call_once(|| {
        let conn = open_conn();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS process_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                level TEXT NOT NULL,
                source TEXT NOT NULL,
                message TEXT NOT NULL
            )",
            [],
        )
        .unwrap();
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_process_logs_timestamp ON process_logs(timestamp DESC)",
            [],
        )
        .ok();
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_process_logs_level ON process_logs(level)",
            [],
        )
        .ok();

        spawn_batch_writer();
    });
}

fn spawn_batch_writer() {
    let (tx, rx) = mpsc::channel::<LogMessage>();
    {
        let mut sender = LOG_SENDER.write().unwrap();
        *sender = Some(tx);
    }

    std::thread::spawn(move || {
        let mut buffer = Vec::with_capacity(100);
        let mut last_flush = Instant::now();
        let flush_interval = Duration::from_secs(1);

        loop {
            let timeout = flush_interval
                .checked_sub(last_flush.elapsed())
                .unwrap_or_else(|| Duration::from_secs(0));

            match rx.recv_timeout(timeout) {
                Ok(msg) => {
                    buffer.push(msg);
                    if buffer.len() >= 100 || last_flush.elapsed() >= flush_interval {
                        flush_logs(&mut buffer);
                        last_flush = Instant::now();
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !buffer.is_empty() {
                        flush_logs(&mut buffer);
                    }
                    last_flush = Instant::now();
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        if !buffer.is_empty() {
            flush_logs(&mut buffer);
        }
    });
}

fn flush_logs(buffer: &mut Vec<LogMessage>) {
    if buffer.is_empty() {
        return;
    }
    let mut conn = open_conn();
    let tx = match conn.transaction() {
        Ok(tx) => tx,
        Err(_) => return,
    };
    for msg in buffer.drain(..) {
        let _ = tx.execute(
            "INSERT INTO process_logs (timestamp, level, source, message) VALUES (?1, ?2, ?3, ?4)",
            params![msg.timestamp, msg.level, msg.source, msg.message],
        );
    }
    let _ = tx.commit();
}

fn log_internal(level: LogLevel, source: &str, message: &str) {
    if level.rank() < MIN_LEVEL.read().unwrap().rank() {
        return;
    }

    let timestamp = chrono::Utc::now().timestamp();
    let msg = LogMessage {
        timestamp,
        level: level.as_str().to_string(),
        source: source.to_string(),
        message: message.to_string(),
    };

    if let Some(sender) = LOG_SENDER.read().unwrap().as_ref() {
        let _ = sender.send(msg);
    } else {
        let conn = open_conn();
        let _ = conn.execute(
            "INSERT INTO process_logs (timestamp, level, source, message) VALUES (?1, ?2, ?3, ?4)",
            params![timestamp, level.as_str(), source, message],
        );
    }
}

pub fn debug(source: &str, message: &str) {
    log_internal(LogLevel::Debug, source, message);
}

pub fn info(source: &str, message: &str) {
    log_internal(LogLevel::Info, source, message);
}

pub fn warn(source: &str, message: &str) {
    log_internal(LogLevel::Warn, source, message);
}

pub fn error(source: &str, message: &str) {
    log_internal(LogLevel::Error, source, message);
}

pub fn query_logs(query: &LogQuery) -> Vec<LogEntry> {
    let conn = open_conn();
    let mut sql = String::from("SELECT id, timestamp, level, source, message FROM process_logs WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref level) = query.level {
        sql.push_str(" AND level = ?");
        params_vec.push(Box::new(level.as_str().to_string()));
    }
    if let Some(ref source) = query.source {
        sql.push_str(" AND source = ?");
        params_vec.push(Box::new(source.clone()));
    }

    sql.push_str(" ORDER BY timestamp DESC");
    let limit = query.limit.unwrap_or(100);
    let offset = query.offset.unwrap_or(0);
    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

    let rows = match stmt.query_map(params_refs.as_slice(), |row| {
        let level_str: String = row.get(2)?;
        Ok(LogEntry {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            level: LogLevel::from_str(&level_str).unwrap_or(LogLevel::Info),
            source: row.get(3)?,
            message: row.get(4)?,
        })
    }) {
        Ok(r) => r,
        Err(_) => return Vec::new(),
    };

    rows.filter_map(|r| r.ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_round_trips_through_str() {
        for lvl in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(LogLevel::from_str(lvl.as_str()), Some(lvl));
        }
    }

    #[test]
    fn level_from_str_is_case_insensitive() {
        assert_eq!(LogLevel::from_str("WARN"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("bogus"), None);
    }

    #[test]
    fn rank_orders_levels_by_severity() {
        assert!(LogLevel::Debug.rank() < LogLevel::Info.rank());
        assert!(LogLevel::Info.rank() < LogLevel::Warn.rank());
        assert!(LogLevel::Warn.rank() < LogLevel::Error.rank());
    }

    #[test]
    fn set_min_level_suppresses_lower_severity_calls() {
        set_min_level(LogLevel::Error);
        debug("test", "should be dropped");
        info("test", "also dropped");
        warn("test", "still dropped");
        // Only error-and-above reach the writer; restore the default so other
        // tests in this process aren't affected by ordering.
        set_min_level(LogLevel::Info);
    }
}

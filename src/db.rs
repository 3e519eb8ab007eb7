//! Persistence port (C1).
//!
//! Typed CRUD over the Provider/Group/Membership/ApiKey/CallLog/ErrorKeyword/
//! Setting tables, plus the three atomic concurrency-counter operations. Every
//! operation opens a short-lived connection rather than holding one open,
//! mirroring the aggregation store's connection-per-unit-of-work idiom.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn db_path() -> PathBuf {
    if let Ok(p) = std::env::var("GATEWAY_DB_PATH") {
        return PathBuf::from(p);
    }
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("llm-gateway");
    std::fs::create_dir_all(&p).ok();
    p.push("gateway.db");
    p
}

pub fn open_conn() -> Connection {
    let conn = Connection::open(db_path()).unwrap();
    optimize_connection(&conn);
    conn
}

fn optimize_connection(conn: &Connection) {
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "foreign_keys", "ON").ok();
    conn.pragma_update(None, "cache_size", "-64000").ok();
    conn.pragma_update(None, "temp_store", "MEMORY").ok();
}

pub fn init() {
    let conn = open_conn();
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS providers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            api_key TEXT NOT NULL,
            upstream_model TEXT NOT NULL,
            unified_price_per_million REAL,
            input_price_per_million REAL,
            output_price_per_million REAL,
            billing_mode TEXT NOT NULL DEFAULT 'per-token',
            is_active INTEGER NOT NULL DEFAULT 1,
            total_calls INTEGER NOT NULL DEFAULT 0,
            successful_calls INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS groups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS memberships (
            provider_id INTEGER NOT NULL REFERENCES providers(id) ON DELETE CASCADE,
            group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            priority INTEGER NOT NULL DEFAULT 1,
            active_calls INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (provider_id, group_id)
        );

        CREATE TABLE IF NOT EXISTS api_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL UNIQUE,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            last_used_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS api_key_groups (
            api_key_id INTEGER NOT NULL REFERENCES api_keys(id) ON DELETE CASCADE,
            group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            PRIMARY KEY (api_key_id, group_id)
        );

        CREATE TABLE IF NOT EXISTS call_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider_id INTEGER REFERENCES providers(id) ON DELETE SET NULL,
            api_key_id INTEGER REFERENCES api_keys(id) ON DELETE SET NULL,
            request_timestamp INTEGER NOT NULL,
            response_timestamp INTEGER,
            is_success INTEGER NOT NULL,
            status_code INTEGER,
            response_time_ms INTEGER,
            error_message TEXT,
            prompt_tokens INTEGER,
            completion_tokens INTEGER,
            total_tokens INTEGER,
            cost REAL
        );

        CREATE TABLE IF NOT EXISTS call_log_details (
            call_log_id INTEGER PRIMARY KEY REFERENCES call_logs(id) ON DELETE CASCADE,
            request_body TEXT,
            response_body TEXT
        );

        CREATE TABLE IF NOT EXISTS error_keywords (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            keyword TEXT NOT NULL UNIQUE,
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            last_triggered INTEGER
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_call_logs_provider_time ON call_logs(provider_id, request_timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_call_logs_time ON call_logs(request_timestamp DESC);
        ",
    )
    .unwrap();

    reset_all_active();
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub name: String,
    pub endpoint: String,
    pub api_key: String,
    pub upstream_model: String,
    pub unified_price_per_million: Option<f64>,
    pub input_price_per_million: Option<f64>,
    pub output_price_per_million: Option<f64>,
    pub billing_mode: String,
    pub is_active: bool,
    pub total_calls: i64,
    pub successful_calls: i64,
}

#[derive(Debug, Deserialize)]
pub struct NewProvider {
    pub name: String,
    pub endpoint: String,
    pub api_key: String,
    pub upstream_model: String,
    pub unified_price_per_million: Option<f64>,
    pub input_price_per_million: Option<f64>,
    pub output_price_per_million: Option<f64>,
    pub billing_mode: Option<String>,
}

fn row_to_provider(row: &rusqlite::Row) -> rusqlite::Result<Provider> {
    Ok(Provider {
        id: row.get(0)?,
        name: row.get(1)?,
        endpoint: row.get(2)?,
        api_key: row.get(3)?,
        upstream_model: row.get(4)?,
        unified_price_per_million: row.get(5)?,
        input_price_per_million: row.get(6)?,
        output_price_per_million: row.get(7)?,
        billing_mode: row.get(8)?,
        is_active: row.get::<_, i64>(9)? != 0,
        total_calls: row.get(10)?,
        successful_calls: row.get(11)?,
    })
}

const PROVIDER_COLUMNS: &str = "id, name, endpoint, api_key, upstream_model, unified_price_per_million, input_price_per_million, output_price_per_million, billing_mode, is_active, total_calls, successful_calls";

pub fn create_provider(p: &NewProvider) -> rusqlite::Result<Provider> {
    let conn = open_conn();
    conn.execute(
        "INSERT INTO providers (name, endpoint, api_key, upstream_model, unified_price_per_million, input_price_per_million, output_price_per_million, billing_mode, is_active, total_calls, successful_calls)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, 0, 0)",
        params![
            p.name, p.endpoint, p.api_key, p.upstream_model,
            p.unified_price_per_million, p.input_price_per_million, p.output_price_per_million,
            p.billing_mode.clone().unwrap_or_else(|| "per-token".to_string()),
        ],
    )?;
    let id = conn.last_insert_rowid();
    get_provider(id).map(|o| o.unwrap())
}

pub fn get_provider(id: i64) -> rusqlite::Result<Option<Provider>> {
    let conn = open_conn();
    conn.query_row(
        &format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = ?1"),
        params![id],
        row_to_provider,
    )
    .optional()
}

pub fn list_providers() -> rusqlite::Result<Vec<Provider>> {
    let conn = open_conn();
    let mut stmt = conn.prepare(&format!("SELECT {PROVIDER_COLUMNS} FROM providers ORDER BY id"))?;
    let rows = stmt.query_map([], row_to_provider)?;
    rows.collect()
}

pub fn update_provider(id: i64, p: &NewProvider) -> rusqlite::Result<Option<Provider>> {
    let conn = open_conn();
    conn.execute(
        "UPDATE providers SET name=?1, endpoint=?2, api_key=?3, upstream_model=?4,
         unified_price_per_million=?5, input_price_per_million=?6, output_price_per_million=?7, billing_mode=?8
         WHERE id=?9",
        params![
            p.name, p.endpoint, p.api_key, p.upstream_model,
            p.unified_price_per_million, p.input_price_per_million, p.output_price_per_million,
            p.billing_mode.clone().unwrap_or_else(|| "per-token".to_string()),
            id,
        ],
    )?;
    get_provider(id)
}

pub fn set_provider_active(id: i64, active: bool) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute(
        "UPDATE providers SET is_active = ?1 WHERE id = ?2",
        params![active as i64, id],
    )?;
    Ok(())
}

pub fn delete_provider(id: i64) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute("DELETE FROM providers WHERE id = ?1", params![id])?;
    Ok(())
}

/// Looks up a provider by its `(endpoint, api_key, upstream_model)` triplet,
/// used by model import to decide whether a fetched model is already known.
pub fn find_provider_by_triplet(endpoint: &str, api_key: &str, upstream_model: &str) -> rusqlite::Result<Option<Provider>> {
    let conn = open_conn();
    conn.query_row(
        &format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE endpoint = ?1 AND api_key = ?2 AND upstream_model = ?3"),
        params![endpoint, api_key, upstream_model],
        row_to_provider,
    )
    .optional()
}

/// All providers sharing an `(endpoint, api_key)` pair, used by model import
/// to deactivate providers whose model dropped out of the fetched list.
pub fn list_providers_by_endpoint_key(endpoint: &str, api_key: &str) -> rusqlite::Result<Vec<Provider>> {
    let conn = open_conn();
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROVIDER_COLUMNS} FROM providers WHERE endpoint = ?1 AND api_key = ?2"
    ))?;
    let rows = stmt.query_map(params![endpoint, api_key], row_to_provider)?;
    rows.collect()
}

pub fn record_provider_call(id: i64, success: bool) -> rusqlite::Result<()> {
    let conn = open_conn();
    if success {
        conn.execute(
            "UPDATE providers SET total_calls = total_calls + 1, successful_calls = successful_calls + 1 WHERE id = ?1",
            params![id],
        )?;
    } else {
        conn.execute(
            "UPDATE providers SET total_calls = total_calls + 1 WHERE id = ?1",
            params![id],
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
}

pub fn create_group(name: &str) -> rusqlite::Result<Group> {
    let conn = open_conn();
    conn.execute("INSERT INTO groups (name) VALUES (?1)", params![name])?;
    let id = conn.last_insert_rowid();
    Ok(Group { id, name: name.to_string() })
}

pub fn get_group_by_name(name: &str) -> rusqlite::Result<Option<Group>> {
    let conn = open_conn();
    conn.query_row(
        "SELECT id, name FROM groups WHERE name = ?1",
        params![name],
        |row| Ok(Group { id: row.get(0)?, name: row.get(1)? }),
    )
    .optional()
}

pub fn list_groups() -> rusqlite::Result<Vec<Group>> {
    let conn = open_conn();
    let mut stmt = conn.prepare("SELECT id, name FROM groups ORDER BY id")?;
    let rows = stmt.query_map([], |row| Ok(Group { id: row.get(0)?, name: row.get(1)? }))?;
    rows.collect()
}

pub fn delete_group(id: i64) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute("DELETE FROM groups WHERE id = ?1", params![id])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Membership {
    pub provider_id: i64,
    pub group_id: i64,
    pub priority: i64,
    pub active_calls: i64,
}

/// Upsert keyed by `(provider_id, group_id)`: an existing pair has only its
/// priority updated; `active_calls` is preserved.
pub fn upsert_membership(provider_id: i64, group_id: i64, priority: i64) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute(
        "INSERT INTO memberships (provider_id, group_id, priority, active_calls) VALUES (?1, ?2, ?3, 0)
         ON CONFLICT(provider_id, group_id) DO UPDATE SET priority = excluded.priority",
        params![provider_id, group_id, priority],
    )?;
    Ok(())
}

pub fn delete_membership(provider_id: i64, group_id: i64) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute(
        "DELETE FROM memberships WHERE provider_id = ?1 AND group_id = ?2",
        params![provider_id, group_id],
    )?;
    Ok(())
}

/// Active providers in a group paired with their membership row, for the
/// selector. Ordering (tier, least-loaded, provider id) is left to the
/// caller — this returns the raw eligible set.
pub fn active_memberships_for_group(group_id: i64) -> rusqlite::Result<Vec<(Provider, Membership)>> {
    let conn = open_conn();
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROVIDER_COLUMNS}, m.priority, m.active_calls
         FROM memberships m JOIN providers p ON p.id = m.provider_id
         WHERE m.group_id = ?1 AND p.is_active = 1"
    ))?;
    let rows = stmt.query_map(params![group_id], |row| {
        let provider = row_to_provider(row)?;
        let membership = Membership {
            provider_id: provider.id,
            group_id,
            priority: row.get(12)?,
            active_calls: row.get(13)?,
        };
        Ok((provider, membership))
    })?;
    rows.collect()
}

pub fn incr_active(provider_id: i64, group_id: i64) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute(
        "UPDATE memberships SET active_calls = active_calls + 1 WHERE provider_id = ?1 AND group_id = ?2",
        params![provider_id, group_id],
    )?;
    Ok(())
}

pub fn decr_active(provider_id: i64, group_id: i64) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute(
        "UPDATE memberships SET active_calls = active_calls - 1 WHERE provider_id = ?1 AND group_id = ?2 AND active_calls > 0",
        params![provider_id, group_id],
    )?;
    Ok(())
}

pub fn reset_all_active() {
    let conn = open_conn();
    let _ = conn.execute("UPDATE memberships SET active_calls = 0", []);
}

// ---------------------------------------------------------------------------
// ApiKey
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: i64,
    pub key: String,
    pub is_active: bool,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
}

fn row_to_api_key(row: &rusqlite::Row) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        id: row.get(0)?,
        key: row.get(1)?,
        is_active: row.get::<_, i64>(2)? != 0,
        created_at: row.get(3)?,
        last_used_at: row.get(4)?,
    })
}

const API_KEY_COLUMNS: &str = "id, key, is_active, created_at, last_used_at";

/// 48 alphanumeric characters, `sk-` prefix, using the OS RNG.
pub fn generate_api_key_token() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let body: String = (0..48)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("sk-{body}")
}

pub fn create_api_key(group_ids: &[i64]) -> rusqlite::Result<ApiKey> {
    let mut conn = open_conn();
    let token = generate_api_key_token();
    let now = chrono::Utc::now().timestamp();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO api_keys (key, is_active, created_at, last_used_at) VALUES (?1, 1, ?2, NULL)",
        params![token, now],
    )?;
    let id = tx.last_insert_rowid();
    for gid in group_ids {
        tx.execute(
            "INSERT INTO api_key_groups (api_key_id, group_id) VALUES (?1, ?2)",
            params![id, gid],
        )?;
    }
    tx.commit()?;
    Ok(ApiKey { id, key: token, is_active: true, created_at: now, last_used_at: None })
}

pub fn get_api_key_by_token(token: &str) -> rusqlite::Result<Option<ApiKey>> {
    let conn = open_conn();
    conn.query_row(
        &format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key = ?1"),
        params![token],
        row_to_api_key,
    )
    .optional()
}

pub fn touch_api_key(id: i64) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute(
        "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
        params![chrono::Utc::now().timestamp(), id],
    )?;
    Ok(())
}

pub fn set_api_key_active(id: i64, active: bool) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute(
        "UPDATE api_keys SET is_active = ?1 WHERE id = ?2",
        params![active as i64, id],
    )?;
    Ok(())
}

pub fn delete_api_key(id: i64) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute("DELETE FROM api_keys WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn list_api_keys() -> rusqlite::Result<Vec<ApiKey>> {
    let conn = open_conn();
    let mut stmt = conn.prepare(&format!("SELECT {API_KEY_COLUMNS} FROM api_keys ORDER BY id"))?;
    let rows = stmt.query_map([], row_to_api_key)?;
    rows.collect()
}

pub fn authorized_group_names(api_key_id: i64) -> rusqlite::Result<Vec<String>> {
    let conn = open_conn();
    let mut stmt = conn.prepare(
        "SELECT g.name FROM api_key_groups akg JOIN groups g ON g.id = akg.group_id WHERE akg.api_key_id = ?1 ORDER BY g.name",
    )?;
    let rows = stmt.query_map(params![api_key_id], |row| row.get::<_, String>(0))?;
    rows.collect()
}

pub fn set_api_key_groups(api_key_id: i64, group_ids: &[i64]) -> rusqlite::Result<()> {
    let mut conn = open_conn();
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM api_key_groups WHERE api_key_id = ?1", params![api_key_id])?;
    for gid in group_ids {
        tx.execute(
            "INSERT INTO api_key_groups (api_key_id, group_id) VALUES (?1, ?2)",
            params![api_key_id, gid],
        )?;
    }
    tx.commit()
}

// ---------------------------------------------------------------------------
// CallLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CallLog {
    pub id: i64,
    pub provider_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub request_timestamp: i64,
    pub response_timestamp: Option<i64>,
    pub is_success: bool,
    pub status_code: Option<i64>,
    pub response_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost: Option<f64>,
}

#[derive(Debug, Default)]
pub struct NewCallLog {
    pub provider_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub request_timestamp: i64,
    pub response_timestamp: Option<i64>,
    pub is_success: bool,
    pub status_code: Option<i64>,
    pub response_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost: Option<f64>,
    pub request_body: Option<String>,
    pub response_body: Option<String>,
}

pub fn insert_call_log(log: &NewCallLog) -> rusqlite::Result<i64> {
    let mut conn = open_conn();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO call_logs (provider_id, api_key_id, request_timestamp, response_timestamp, is_success, status_code, response_time_ms, error_message, prompt_tokens, completion_tokens, total_tokens, cost)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            log.provider_id, log.api_key_id, log.request_timestamp, log.response_timestamp,
            log.is_success as i64, log.status_code, log.response_time_ms, log.error_message,
            log.prompt_tokens, log.completion_tokens, log.total_tokens, log.cost,
        ],
    )?;
    let id = tx.last_insert_rowid();
    if log.request_body.is_some() || log.response_body.is_some() {
        tx.execute(
            "INSERT INTO call_log_details (call_log_id, request_body, response_body) VALUES (?1, ?2, ?3)",
            params![id, log.request_body, log.response_body],
        )?;
    }
    tx.commit()?;
    Ok(id)
}

fn row_to_call_log(row: &rusqlite::Row) -> rusqlite::Result<CallLog> {
    Ok(CallLog {
        id: row.get(0)?,
        provider_id: row.get(1)?,
        api_key_id: row.get(2)?,
        request_timestamp: row.get(3)?,
        response_timestamp: row.get(4)?,
        is_success: row.get::<_, i64>(5)? != 0,
        status_code: row.get(6)?,
        response_time_ms: row.get(7)?,
        error_message: row.get(8)?,
        prompt_tokens: row.get(9)?,
        completion_tokens: row.get(10)?,
        total_tokens: row.get(11)?,
        cost: row.get(12)?,
    })
}

const CALL_LOG_COLUMNS: &str = "id, provider_id, api_key_id, request_timestamp, response_timestamp, is_success, status_code, response_time_ms, error_message, prompt_tokens, completion_tokens, total_tokens, cost";

pub fn list_call_logs(limit: i64, offset: i64) -> rusqlite::Result<Vec<CallLog>> {
    let conn = open_conn();
    let mut stmt = conn.prepare(&format!(
        "SELECT {CALL_LOG_COLUMNS} FROM call_logs ORDER BY request_timestamp DESC LIMIT ?1 OFFSET ?2"
    ))?;
    let rows = stmt.query_map(params![limit, offset], row_to_call_log)?;
    rows.collect()
}

pub fn get_call_log(id: i64) -> rusqlite::Result<Option<(CallLog, Option<String>, Option<String>)>> {
    let conn = open_conn();
    let log = conn
        .query_row(
            &format!("SELECT {CALL_LOG_COLUMNS} FROM call_logs WHERE id = ?1"),
            params![id],
            row_to_call_log,
        )
        .optional()?;
    let Some(log) = log else { return Ok(None) };
    let detail = conn
        .query_row(
            "SELECT request_body, response_body FROM call_log_details WHERE call_log_id = ?1",
            params![id],
            |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()?
        .unwrap_or((None, None));
    Ok(Some((log, detail.0, detail.1)))
}

pub fn failure_count_since(provider_id: i64, since_unix: i64) -> rusqlite::Result<i64> {
    let conn = open_conn();
    conn.query_row(
        "SELECT COUNT(*) FROM call_logs WHERE provider_id = ?1 AND is_success = 0 AND request_timestamp >= ?2",
        params![provider_id, since_unix],
        |row| row.get(0),
    )
}

pub struct DashboardCounts {
    pub total_calls: i64,
    pub successful_calls: i64,
    pub total_cost: f64,
    pub total_tokens: i64,
}

pub fn dashboard_counts() -> rusqlite::Result<DashboardCounts> {
    let conn = open_conn();
    conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(is_success),0), COALESCE(SUM(cost),0), COALESCE(SUM(total_tokens),0) FROM call_logs",
        [],
        |row| {
            Ok(DashboardCounts {
                total_calls: row.get(0)?,
                successful_calls: row.get(1)?,
                total_cost: row.get(2)?,
                total_tokens: row.get(3)?,
            })
        },
    )
}

pub fn daily_histogram(days: i64) -> rusqlite::Result<Vec<(String, i64, f64)>> {
    let conn = open_conn();
    let mut stmt = conn.prepare(
        "SELECT date(request_timestamp, 'unixepoch'), COUNT(*), COALESCE(SUM(cost),0)
         FROM call_logs WHERE request_timestamp >= strftime('%s','now','-'||?1||' day')
         GROUP BY 1 ORDER BY 1",
    )?;
    let rows = stmt.query_map(params![days], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, f64>(2)?))
    })?;
    rows.collect()
}

// ---------------------------------------------------------------------------
// ErrorKeyword
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ErrorKeyword {
    pub id: i64,
    pub keyword: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub last_triggered: Option<i64>,
}

fn row_to_keyword(row: &rusqlite::Row) -> rusqlite::Result<ErrorKeyword> {
    Ok(ErrorKeyword {
        id: row.get(0)?,
        keyword: row.get(1)?,
        description: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        last_triggered: row.get(4)?,
    })
}

pub fn list_active_keywords() -> rusqlite::Result<Vec<ErrorKeyword>> {
    let conn = open_conn();
    let mut stmt = conn.prepare(
        "SELECT id, keyword, description, is_active, last_triggered FROM error_keywords WHERE is_active = 1",
    )?;
    let rows = stmt.query_map([], row_to_keyword)?;
    rows.collect()
}

pub fn create_keyword(keyword: &str, description: Option<&str>) -> rusqlite::Result<ErrorKeyword> {
    let conn = open_conn();
    conn.execute(
        "INSERT INTO error_keywords (keyword, description, is_active, last_triggered) VALUES (?1, ?2, 1, NULL)",
        params![keyword, description],
    )?;
    let id = conn.last_insert_rowid();
    Ok(ErrorKeyword { id, keyword: keyword.to_string(), description: description.map(String::from), is_active: true, last_triggered: None })
}

pub fn mark_keyword_triggered(id: i64) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute(
        "UPDATE error_keywords SET last_triggered = ?1 WHERE id = ?2",
        params![chrono::Utc::now().timestamp(), id],
    )?;
    Ok(())
}

pub fn delete_keyword(id: i64) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute("DELETE FROM error_keywords WHERE id = ?1", params![id])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Setting
// ---------------------------------------------------------------------------

pub fn get_setting(key: &str) -> rusqlite::Result<Option<String>> {
    let conn = open_conn();
    conn.query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
        .optional()
}

pub fn set_setting(key: &str, value: &str) -> rusqlite::Result<()> {
    let conn = open_conn();
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_api_key_has_expected_shape() {
        let token = generate_api_key_token();
        assert!(token.starts_with("sk-"));
        assert_eq!(token.len(), 51);
    }

    #[test]
    fn membership_upsert_preserves_active_calls() {
        // Exercised against a real on-disk temp db since :memory: doesn't
        // survive across the connection-per-call pattern used here.
        let dir = std::env::temp_dir().join(format!("gw-test-{}.db", std::process::id()));
        std::env::set_var("GATEWAY_DB_PATH", dir.to_str().unwrap());
        init();

        let provider = create_provider(&NewProvider {
            name: "p1".into(),
            endpoint: "https://example.com/v1".into(),
            api_key: "key".into(),
            upstream_model: "gpt-4".into(),
            unified_price_per_million: Some(1.0),
            input_price_per_million: None,
            output_price_per_million: None,
            billing_mode: None,
        })
        .unwrap();
        let group = create_group("g1").unwrap();

        upsert_membership(provider.id, group.id, 1).unwrap();
        incr_active(provider.id, group.id).unwrap();
        incr_active(provider.id, group.id).unwrap();
        upsert_membership(provider.id, group.id, 5).unwrap();

        let active = active_memberships_for_group(group.id).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].1.priority, 5);
        assert_eq!(active[0].1.active_calls, 2);

        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn decr_active_does_not_go_below_zero() {
        let dir = std::env::temp_dir().join(format!("gw-test2-{}.db", std::process::id()));
        std::env::set_var("GATEWAY_DB_PATH", dir.to_str().unwrap());
        init();

        let provider = create_provider(&NewProvider {
            name: "p2".into(),
            endpoint: "https://example.com/v1".into(),
            api_key: "key".into(),
            upstream_model: "gpt-4".into(),
            unified_price_per_million: None,
            input_price_per_million: None,
            output_price_per_million: None,
            billing_mode: None,
        })
        .unwrap();
        let group = create_group("g2").unwrap();
        upsert_membership(provider.id, group.id, 1).unwrap();

        decr_active(provider.id, group.id).unwrap();
        let active = active_memberships_for_group(group.id).unwrap();
        assert_eq!(active[0].1.active_calls, 0);

        std::fs::remove_file(&dir).ok();
    }
}

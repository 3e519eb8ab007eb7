//! Admin JSON surface (C1's contract exposed to an external collaborator):
//! thin CRUD handlers and aggregate queries. No browser UI lives here.

use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::config;
use crate::db::{self, NewProvider};
use crate::error::{AppError, AppResult};
use crate::{auth, logger};

fn require_admin(headers: &HeaderMap) -> AppResult<()> {
    let settings = config::load();
    let token = auth::extract_bearer(headers).ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;
    auth::verify_admin_token(&token, &settings.jwt_secret)
        .map_err(|_| AppError::Unauthorized("invalid or expired token".into()))?;
    Ok(())
}

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

pub async fn login(Json(req): Json<LoginRequest>) -> impl IntoResponse {
    let settings = config::load();
    if req.username != settings.admin_username || req.password != settings.admin_password {
        return AppError::Unauthorized("invalid credentials".into()).into_response();
    }
    match auth::mint_admin_token(&req.username, &settings.jwt_secret) {
        Ok(token) => Json(json!({ "token": token })).into_response(),
        Err(e) => AppError::Internal(format!("failed to mint token: {e}")).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub async fn list_providers(headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::list_providers() {
        Ok(providers) => Json(providers).into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn create_provider(headers: HeaderMap, Json(body): Json<NewProvider>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::create_provider(&body) {
        Ok(p) => (StatusCode::CREATED, Json(p)).into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn update_provider(
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<NewProvider>,
) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::update_provider(id, &body) {
        Ok(Some(p)) => Json(p).into_response(),
        Ok(None) => AppError::NotFound(format!("provider {id}")).into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn delete_provider(headers: HeaderMap, Path(id): Path<i64>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::delete_provider(id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

#[derive(Deserialize)]
pub struct SetActiveRequest {
    active: bool,
}

pub async fn set_provider_active(
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<SetActiveRequest>,
) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::set_provider_active(id, body.active) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct NewGroupRequest {
    name: String,
}

pub async fn list_groups(headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::list_groups() {
        Ok(groups) => Json(groups).into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn create_group(headers: HeaderMap, Json(body): Json<NewGroupRequest>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::create_group(&body.name) {
        Ok(g) => (StatusCode::CREATED, Json(g)).into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn delete_group(headers: HeaderMap, Path(id): Path<i64>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::delete_group(id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct MembershipRequest {
    provider_id: i64,
    group_id: i64,
    priority: i64,
}

pub async fn upsert_membership(headers: HeaderMap, Json(body): Json<MembershipRequest>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::upsert_membership(body.provider_id, body.group_id, body.priority) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn delete_membership(headers: HeaderMap, Path((provider_id, group_id)): Path<(i64, i64)>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::delete_membership(provider_id, group_id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// ApiKey
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct NewApiKeyRequest {
    group_ids: Vec<i64>,
}

pub async fn list_api_keys(headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::list_api_keys() {
        Ok(keys) => Json(keys).into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn create_api_key(headers: HeaderMap, Json(body): Json<NewApiKeyRequest>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::create_api_key(&body.group_ids) {
        Ok(key) => (StatusCode::CREATED, Json(key)).into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn set_api_key_active(
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<SetActiveRequest>,
) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::set_api_key_active(id, body.active) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn delete_api_key(headers: HeaderMap, Path(id): Path<i64>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::delete_api_key(id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn set_api_key_groups(
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<NewApiKeyRequest>,
) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::set_api_key_groups(id, &body.group_ids) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// ErrorKeyword
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct NewKeywordRequest {
    keyword: String,
    description: Option<String>,
}

pub async fn list_keywords(headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::list_active_keywords() {
        Ok(keywords) => Json(keywords).into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn create_keyword(headers: HeaderMap, Json(body): Json<NewKeywordRequest>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::create_keyword(&body.keyword, body.description.as_deref()) {
        Ok(k) => (StatusCode::CREATED, Json(k)).into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn delete_keyword(headers: HeaderMap, Path(id): Path<i64>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::delete_keyword(id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Setting
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SettingRequest {
    value: String,
}

pub async fn get_setting(headers: HeaderMap, Path(key): Path<String>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::get_setting(&key) {
        Ok(Some(value)) => Json(json!({ "key": key, "value": value })).into_response(),
        Ok(None) => AppError::NotFound(format!("setting {key}")).into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn put_setting(
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(body): Json<SettingRequest>,
) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::set_setting(&key, &body.value) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

// ---------------------------------------------------------------------------
// CallLog + dashboard
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CallLogQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

pub async fn list_call_logs(headers: HeaderMap, Query(q): Query<CallLogQuery>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    let limit = q.limit.unwrap_or(50);
    let offset = q.offset.unwrap_or(0);
    match db::list_call_logs(limit, offset) {
        Ok(logs) => Json(json!({ "logs": logs, "limit": limit, "offset": offset })).into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn get_call_log(headers: HeaderMap, Path(id): Path<i64>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    match db::get_call_log(id) {
        Ok(Some((log, request_body, response_body))) => {
            Json(json!({ "log": log, "request_body": request_body, "response_body": response_body })).into_response()
        }
        Ok(None) => AppError::NotFound(format!("call log {id}")).into_response(),
        Err(e) => AppError::Database(e).into_response(),
    }
}

pub async fn list_process_logs(headers: HeaderMap, Query(q): Query<logger::LogQuery>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    let entries = logger::query_logs(&q);
    Json(json!({ "logs": entries })).into_response()
}

pub async fn dashboard(headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    let counts = match db::dashboard_counts() {
        Ok(c) => c,
        Err(e) => return AppError::Database(e).into_response(),
    };
    let histogram = db::daily_histogram(30).unwrap_or_default();
    Json(json!({
        "total_calls": counts.total_calls,
        "successful_calls": counts.successful_calls,
        "success_rate": if counts.total_calls > 0 { counts.successful_calls as f64 / counts.total_calls as f64 } else { 0.0 },
        "total_cost": counts.total_cost,
        "total_tokens": counts.total_tokens,
        "daily_histogram": histogram.iter().map(|(d, c, cost)| json!({ "date": d, "calls": c, "cost": cost })).collect::<Vec<_>>(),
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// Model import
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum FilterMode {
    None,
    Include,
    Exclude,
}

#[derive(Deserialize)]
pub struct ImportModelsRequest {
    base_url: String,
    api_key: String,
    alias: Option<String>,
    default_type: String,
    filter_mode: FilterMode,
    filter_keyword: Option<String>,
}

fn passes_filter(model_id: &str, mode: &FilterMode, keyword: &Option<String>) -> bool {
    let Some(keyword) = keyword.as_deref().filter(|k| !k.is_empty()) else {
        return true;
    };
    let hit = model_id.to_lowercase().contains(&keyword.to_lowercase());
    match mode {
        FilterMode::None => true,
        FilterMode::Include => hit,
        FilterMode::Exclude => !hit,
    }
}

fn display_name(alias: &Option<String>, model_id: &str) -> String {
    alias.clone().unwrap_or_else(|| model_id.replace('/', "."))
}

/// Streams import progress as plain-text lines (`TOTAL=`, `PROGRESS=`, then
/// one final `DONE=` or `ERROR=`), mirroring the one-shot streamed admin
/// operations used elsewhere in the gateway for long-running upstream calls.
pub async fn import_models(headers: HeaderMap, Json(req): Json<ImportModelsRequest>) -> impl IntoResponse {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<axum::body::Bytes, std::io::Error>>(8);

    tokio::spawn(async move {
        let send = |tx: &tokio::sync::mpsc::Sender<Result<axum::body::Bytes, std::io::Error>>, line: String| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Ok(axum::body::Bytes::from(format!("{line}\n")))).await;
            }
        };

        let trimmed = req.base_url.trim_end_matches('/');
        let base = if trimmed.ends_with("/v1") { trimmed.to_string() } else { format!("{trimmed}/v1") };
        let chat_endpoint = format!("{base}/chat/completions");

        let client = reqwest::Client::new();
        let response = match client.get(format!("{base}/models")).bearer_auth(&req.api_key).send().await {
            Ok(r) => r,
            Err(e) => {
                send(&tx, format!("ERROR=failed to reach upstream: {e}")).await;
                return;
            }
        };
        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                send(&tx, format!("ERROR=invalid model list response: {e}")).await;
                return;
            }
        };
        let Some(models) = body.get("data").and_then(|d| d.as_array()) else {
            send(&tx, "ERROR=upstream model list missing 'data'".to_string()).await;
            return;
        };

        let ids: Vec<String> = models
            .iter()
            .filter_map(|m| m.get("id").and_then(|v| v.as_str()))
            .filter(|id| passes_filter(id, &req.filter_mode, &req.filter_keyword))
            .map(str::to_string)
            .collect();

        send(&tx, format!("TOTAL={}", ids.len())).await;

        let mut seen = std::collections::HashSet::new();
        for (k, id) in ids.iter().enumerate() {
            seen.insert(id.clone());
            match db::find_provider_by_triplet(&chat_endpoint, &req.api_key, id) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    let provider = db::NewProvider {
                        name: display_name(&req.alias, id),
                        endpoint: chat_endpoint.clone(),
                        api_key: req.api_key.clone(),
                        upstream_model: id.clone(),
                        unified_price_per_million: None,
                        input_price_per_million: None,
                        output_price_per_million: None,
                        billing_mode: Some(req.default_type.clone()),
                    };
                    if let Err(e) = db::create_provider(&provider) {
                        logger::error("admin", &format!("failed to import model {id}: {e}"));
                    }
                }
                Err(e) => logger::error("admin", &format!("failed to look up model {id}: {e}")),
            }
            send(&tx, format!("PROGRESS={}", k + 1)).await;
        }

        let stale = db::list_providers_by_endpoint_key(&chat_endpoint, &req.api_key)
            .unwrap_or_default();
        let mut deactivated = 0;
        for provider in stale {
            if !seen.contains(&provider.upstream_model) && provider.is_active {
                if db::set_provider_active(provider.id, false).is_ok() {
                    deactivated += 1;
                }
            }
        }

        send(&tx, format!("DONE=imported {} model(s), deactivated {deactivated} stale provider(s)", ids.len())).await;
    });

    let stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
    axum::response::Response::builder()
        .header("content-type", "text/plain; charset=utf-8")
        .body(axum::body::Body::from_stream(stream))
        .unwrap()
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn passes_filter_none_mode_ignores_keyword() {
        assert!(passes_filter("gpt-4", &FilterMode::None, &Some("claude".into())));
    }

    #[test]
    fn passes_filter_include_mode_requires_match() {
        assert!(passes_filter("claude-3-opus", &FilterMode::Include, &Some("claude".into())));
        assert!(!passes_filter("gpt-4", &FilterMode::Include, &Some("claude".into())));
    }

    #[test]
    fn passes_filter_exclude_mode_drops_match() {
        assert!(!passes_filter("claude-3-opus", &FilterMode::Exclude, &Some("claude".into())));
        assert!(passes_filter("gpt-4", &FilterMode::Exclude, &Some("claude".into())));
    }

    #[test]
    fn passes_filter_is_case_insensitive() {
        assert!(passes_filter("Claude-3-Opus", &FilterMode::Include, &Some("CLAUDE".into())));
    }

    #[test]
    fn passes_filter_with_no_keyword_always_passes() {
        assert!(passes_filter("anything", &FilterMode::Include, &None));
        assert!(passes_filter("anything", &FilterMode::Exclude, &Some("".into())));
    }

    #[test]
    fn display_name_prefers_alias() {
        assert_eq!(display_name(&Some("my-alias".into()), "openai/gpt-4"), "my-alias");
    }

    #[test]
    fn display_name_falls_back_to_dotted_model_id() {
        assert_eq!(display_name(&None, "openai/gpt-4"), "openai.gpt-4");
    }

    #[test]
    fn require_admin_rejects_missing_bearer_token() {
        let headers = HeaderMap::new();
        assert!(require_admin(&headers).is_err());
    }

    #[test]
    fn require_admin_rejects_garbage_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer not-a-real-jwt"));
        assert!(require_admin(&headers).is_err());
    }
}

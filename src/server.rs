//! Public HTTP surface (C8): the dialect endpoints clients call through, a
//! small unauthenticated status endpoint, and the admin JSON surface mounted
//! under `/admin`.

use axum::extract::Json as JsonExtract;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;

use crate::db;
use crate::proxy::{dialect, engine, ProxyError};
use crate::{admin, auth, config, selector};

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Unauthenticated snapshot of the routing topology: every group, every
/// provider's public-facing shape, and the live `active_calls` count per
/// membership. Useful for an operator's dashboard without minting a token.
async fn status() -> Json<Value> {
    let groups = db::list_groups().unwrap_or_default();
    let providers = db::list_providers().unwrap_or_default();

    let mut active_calls = Vec::new();
    for group in &groups {
        if let Ok(memberships) = db::active_memberships_for_group(group.id) {
            for (provider, membership) in memberships {
                active_calls.push(json!({
                    "provider_id": provider.id,
                    "group_id": group.id,
                    "active_calls": membership.active_calls,
                }));
            }
        }
    }

    Json(json!({
        "groups": groups.iter().map(|g| json!({ "id": g.id, "name": g.name })).collect::<Vec<_>>(),
        "providers": providers.iter().map(|p| json!({
            "id": p.id, "display_name": p.name, "model": p.upstream_model, "endpoint": p.endpoint,
        })).collect::<Vec<_>>(),
        "active_calls": active_calls,
    }))
}

async fn authenticate(headers: &HeaderMap, payload: &Value) -> Result<db::ApiKey, ProxyError> {
    let Some(token) = auth::extract_api_key(headers) else {
        engine::log_denied(None, 401, "missing api key", payload);
        return Err(ProxyError::Unauthorized("missing api key".into()));
    };
    let key = db::get_api_key_by_token(&token).map_err(|e| ProxyError::UpstreamFailed(e.to_string()))?;
    let Some(key) = key.filter(|k| k.is_active) else {
        engine::log_denied(None, 401, "invalid or inactive api key", payload);
        return Err(ProxyError::Unauthorized("invalid or inactive api key".into()));
    };
    let _ = db::touch_api_key(key.id);
    Ok(key)
}

fn authorize(api_key: &db::ApiKey, model: &str, payload: &Value) -> Result<String, ProxyError> {
    let groups = db::authorized_group_names(api_key.id).unwrap_or_default();
    match selector::authorize_model(model, &groups) {
        Some(group) => Ok(group),
        None => {
            let message = format!("api key not authorized for model '{model}'");
            engine::log_denied(Some(api_key.id), 403, &message, payload);
            Err(ProxyError::Forbidden(message))
        }
    }
}

fn required_model(payload: &Value) -> Result<String, ProxyError> {
    payload
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProxyError::Validation("request body is missing 'model'".into()))
}

fn wants_stream(payload: &Value) -> bool {
    payload.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

/// `POST /v1/chat/completions` and its `/v1/responses` alias: canonical
/// dialect, forwarded close to verbatim.
async fn chat_completions(headers: HeaderMap, JsonExtract(payload): JsonExtract<Value>) -> Result<Response, ProxyError> {
    let api_key = authenticate(&headers, &payload).await?;
    let model = required_model(&payload)?;
    let group = authorize(&api_key, &model, &payload)?;

    if wants_stream(&payload) {
        engine::attempt_streaming(&group, Some(api_key.id), payload, "/chat/completions", config::CHAT_TIMEOUT).await
    } else {
        let response = engine::attempt_non_streaming(&group, Some(api_key.id), payload, "/chat/completions", config::CHAT_TIMEOUT).await?;
        Ok(Json(dialect::sanitize_chat_response(response)).into_response())
    }
}

/// `POST /v1/completions`: the legacy single-prompt form, forwarded to the
/// upstream's `/completions` path with no translation beyond model routing.
async fn completions(headers: HeaderMap, JsonExtract(payload): JsonExtract<Value>) -> Result<Response, ProxyError> {
    let api_key = authenticate(&headers, &payload).await?;
    let model = required_model(&payload)?;
    let group = authorize(&api_key, &model, &payload)?;

    if wants_stream(&payload) {
        engine::attempt_streaming(&group, Some(api_key.id), payload, "/completions", config::CHAT_TIMEOUT).await
    } else {
        let response = engine::attempt_non_streaming(&group, Some(api_key.id), payload, "/completions", config::CHAT_TIMEOUT).await?;
        Ok(Json(response).into_response())
    }
}

/// `POST /v1/messages`: the third-party messages dialect. Requests are
/// translated to the canonical chat shape before dispatch; responses are
/// translated back, either as one JSON object or as the fixed SSE frame
/// sequence.
async fn messages(headers: HeaderMap, JsonExtract(msg): JsonExtract<Value>) -> Result<Response, ProxyError> {
    let api_key = authenticate(&headers, &msg).await?;
    let model = required_model(&msg)?;
    let group = authorize(&api_key, &model, &msg)?;
    let chat_payload = dialect::msg_to_chat_request(&msg);

    if wants_stream(&msg) {
        engine::attempt_streaming_as_msg(&group, Some(api_key.id), chat_payload, &model, config::CHAT_TIMEOUT).await
    } else {
        let response = engine::attempt_non_streaming(&group, Some(api_key.id), chat_payload, "/chat/completions", config::CHAT_TIMEOUT).await?;
        let sanitized = dialect::sanitize_chat_response(response);
        Ok(Json(dialect::chat_response_to_msg(&sanitized, &model)).into_response())
    }
}

/// `POST /v1/embeddings`: thin pass-through, no dialect translation.
async fn embeddings(headers: HeaderMap, JsonExtract(payload): JsonExtract<Value>) -> Result<Response, ProxyError> {
    let api_key = authenticate(&headers, &payload).await?;
    let model = required_model(&payload)?;
    let group = authorize(&api_key, &model, &payload)?;
    let response = engine::attempt_non_streaming(&group, Some(api_key.id), payload, "/embeddings", config::EMBEDDINGS_TIMEOUT).await?;
    Ok(Json(response).into_response())
}

/// `POST /v1/images/generations`: thin pass-through, no dialect translation.
async fn image_generations(headers: HeaderMap, JsonExtract(payload): JsonExtract<Value>) -> Result<Response, ProxyError> {
    let api_key = authenticate(&headers, &payload).await?;
    let model = required_model(&payload)?;
    let group = authorize(&api_key, &model, &payload)?;
    let response = engine::attempt_non_streaming(&group, Some(api_key.id), payload, "/images/generations", config::IMAGE_GENERATION_TIMEOUT).await?;
    Ok(Json(response).into_response())
}

/// `GET /v1/models`: lists the group names an API key is authorized for as
/// model ids, the same shape an OpenAI-compatible client expects.
async fn list_models(headers: HeaderMap) -> Result<Json<Value>, ProxyError> {
    let api_key = authenticate(&headers, &Value::Null).await?;
    let groups = db::authorized_group_names(api_key.id).unwrap_or_default();
    let data: Vec<Value> = groups.into_iter().map(|g| json!({ "id": g, "object": "model" })).collect();
    Ok(Json(json!({ "object": "list", "data": data })))
}

pub fn app() -> Router {
    let cors = CorsLayer::permissive();

    let dialect_routes = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/messages", post(messages))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/images/generations", post(image_generations))
        .route("/v1/models", get(list_models));

    let admin_routes = Router::new()
        .route("/admin/login", post(admin::login))
        .route("/admin/providers", get(admin::list_providers).post(admin::create_provider))
        .route(
            "/admin/providers/:id",
            put(admin::update_provider).delete(admin::delete_provider),
        )
        .route("/admin/providers/:id/active", put(admin::set_provider_active))
        .route("/admin/groups", get(admin::list_groups).post(admin::create_group))
        .route("/admin/groups/:id", delete(admin::delete_group))
        .route("/admin/memberships", post(admin::upsert_membership))
        .route("/admin/memberships/:provider_id/:group_id", delete(admin::delete_membership))
        .route("/admin/api-keys", get(admin::list_api_keys).post(admin::create_api_key))
        .route("/admin/api-keys/:id", delete(admin::delete_api_key))
        .route("/admin/api-keys/:id/active", put(admin::set_api_key_active))
        .route("/admin/api-keys/:id/groups", put(admin::set_api_key_groups))
        .route("/admin/keywords", get(admin::list_keywords).post(admin::create_keyword))
        .route("/admin/keywords/:id", delete(admin::delete_keyword))
        .route("/admin/settings/:key", get(admin::get_setting).put(admin::put_setting))
        .route("/admin/call-logs", get(admin::list_call_logs))
        .route("/admin/call-logs/:id", get(admin::get_call_log))
        .route("/admin/logs", get(admin::list_process_logs))
        .route("/admin/dashboard", get(admin::dashboard))
        .route("/admin/import-models", post(admin::import_models));

    Router::new()
        .route("/health", get(health))
        .route("/v1/status", get(status))
        .merge(dialect_routes)
        .merge(admin_routes)
        .layer(cors)
}

pub async fn serve() {
    db::init();
    let app = app();
    let settings = config::load();
    let addr: SocketAddr = settings
        .listen_addr
        .parse()
        .unwrap_or_else(|_| "127.0.0.1:8787".parse().unwrap());
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    crate::logger::info("server", &format!("listening on {addr}"));
    axum::serve(listener, app).await.unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_test_server() -> String {
        let dir = std::env::temp_dir().join(format!("gw-server-test-{}-{}.db", std::process::id(), rand::random::<u32>()));
        std::env::set_var("GATEWAY_DB_PATH", dir.to_str().unwrap());
        db::init();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = app();
        tokio::spawn(async move { axum::serve(listener, a).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn health_ok() {
        let url = spawn_test_server().await;
        let r = reqwest::get(format!("{url}/health")).await.unwrap();
        let body: Value = r.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_empty_topology_by_default() {
        let url = spawn_test_server().await;
        let r = reqwest::get(format!("{url}/v1/status")).await.unwrap();
        let body: Value = r.json().await.unwrap();
        assert_eq!(body["groups"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn chat_completions_without_api_key_is_unauthorized() {
        let url = spawn_test_server().await;
        let client = reqwest::Client::new();
        let r = client
            .post(format!("{url}/v1/chat/completions"))
            .json(&json!({ "model": "gpt-4", "messages": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 401);

        let logs = db::list_call_logs(10, 0).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status_code, Some(401));
        assert!(logs[0].provider_id.is_none());
    }

    #[tokio::test]
    async fn chat_completions_for_unauthorized_model_is_forbidden_and_logged() {
        let url = spawn_test_server().await;
        let group = db::create_group("allowed-group").unwrap();
        let api_key = db::create_api_key(&[group.id]).unwrap();

        let client = reqwest::Client::new();
        let r = client
            .post(format!("{url}/v1/chat/completions"))
            .bearer_auth(&api_key.key)
            .json(&json!({ "model": "some-other-group", "messages": [] }))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 403);

        let logs = db::list_call_logs(10, 0).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status_code, Some(403));
        assert_eq!(logs[0].api_key_id, Some(api_key.id));
    }

    #[tokio::test]
    async fn admin_login_rejects_bad_credentials() {
        let url = spawn_test_server().await;
        let client = reqwest::Client::new();
        let r = client
            .post(format!("{url}/admin/login"))
            .json(&json!({ "username": "nope", "password": "nope" }))
            .send()
            .await
            .unwrap();
        assert_eq!(r.status(), 401);
    }
}

//! Proxy engine (C7): the per-request attempt loop.
//!
//! ```text
//! START -> AUTH -> AUTHORIZE-GROUP -> LOOP -> ATTEMPT -> {SUCCESS | RETRY | EXHAUSTED}
//! ```
//!
//! AUTH and AUTHORIZE-GROUP happen in the HTTP handlers (`server.rs`), which
//! call into [`attempt_non_streaming`] / [`attempt_streaming`] once a group
//! name and a translated payload are in hand.

use axum::body::{Body, Bytes};
use axum::response::Response;
use futures_util::stream::poll_fn;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::concurrency::ActiveCallGuard;
use crate::db::{self, NewCallLog};
use crate::pricing::{self, TokenUsage};
use crate::selector::{self, SelectorOptions};
use crate::sentinel;

use super::dialect;
use super::error::{ProxyError, ProxyResult};
use super::sse::{drain_sse_lines, is_sse_done, parse_sse_data, ThinkFilter};

type ByteSender = mpsc::Sender<Result<Bytes, std::io::Error>>;
type ReadySender = oneshot::Sender<ProxyResult<()>>;

fn selector_options() -> SelectorOptions {
    let health_filter_enabled = db::get_setting("health_filter_enabled")
        .ok()
        .flatten()
        .map(|v| v == "true")
        .unwrap_or(false);
    let failover_threshold_count = db::get_setting("failover_threshold_count")
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok());
    let failover_threshold_period_minutes = db::get_setting("failover_threshold_period_minutes")
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok());
    SelectorOptions {
        health_filter_enabled,
        failover_threshold_count,
        failover_threshold_period_minutes,
    }
}

fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("building the upstream http client should not fail")
}

fn is_quota_exhaustion(error_text: &str) -> bool {
    let lower = error_text.to_lowercase();
    lower.contains("insufficient") && lower.contains("quota")
}

fn log_attempt(
    provider_id: Option<i64>,
    api_key_id: Option<i64>,
    request_started: i64,
    success: bool,
    status: Option<i64>,
    latency_ms: Option<i64>,
    error: Option<String>,
    usage: &TokenUsage,
    cost: Option<f64>,
    request_body: Option<String>,
    response_body: Option<String>,
) {
    let log = NewCallLog {
        provider_id,
        api_key_id,
        request_timestamp: request_started,
        response_timestamp: Some(chrono::Utc::now().timestamp()),
        is_success: success,
        status_code: status,
        response_time_ms: latency_ms,
        error_message: error,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        cost,
        request_body,
        response_body,
    };
    if let Err(e) = db::insert_call_log(&log) {
        crate::logger::error("engine", &format!("failed to write call log: {e}"));
    }
    if let Some(pid) = provider_id {
        let _ = db::record_provider_call(pid, success);
    }
}

/// Logs a request rejected before any upstream was ever selected — a failed
/// AUTH or AUTHORIZE-GROUP step. Used by `server.rs`.
pub(crate) fn log_denied(api_key_id: Option<i64>, status: i64, error: &str, request_body: &Value) {
    log_attempt(
        None,
        api_key_id,
        chrono::Utc::now().timestamp(),
        false,
        Some(status),
        None,
        Some(error.to_string()),
        &TokenUsage::default(),
        None,
        Some(request_body.to_string()),
        None,
    );
}

/// Runs the attempt loop against a non-streaming upstream, returning the raw
/// parsed JSON body on success. `upstream_path` (e.g. `/chat/completions`,
/// `/completions`, `/embeddings`, `/images/generations`) is appended to the
/// selected provider's endpoint.
pub async fn attempt_non_streaming(
    group: &str,
    api_key_id: Option<i64>,
    mut payload: Value,
    upstream_path: &str,
    timeout: Duration,
) -> ProxyResult<Value> {
    let mut excluded: HashSet<i64> = HashSet::new();
    let opts = selector_options();
    let client = http_client(timeout);
    let request_started = chrono::Utc::now().timestamp();

    loop {
        let Some((provider, membership)) = selector::select(group, &excluded, &opts)
            .map_err(|e| ProxyError::UpstreamFailed(e.to_string()))?
        else {
            log_attempt(
                None, api_key_id, request_started, false, Some(503), None,
                Some("no eligible provider".to_string()), &TokenUsage::default(), None, None, None,
            );
            return Err(ProxyError::Exhausted);
        };

        let guard = ActiveCallGuard::acquire(provider.id, membership.group_id)
            .map_err(|e| ProxyError::UpstreamFailed(e.to_string()))?;
        let start = Instant::now();

        if let Some(obj) = payload.as_object_mut() {
            obj.insert("model".to_string(), Value::String(provider.upstream_model.clone()));
        }

        let url = format!("{}{}", provider.endpoint.trim_end_matches('/'), upstream_path);
        let response = client
            .post(&url)
            .bearer_auth(&provider.api_key)
            .json(&payload)
            .send()
            .await;

        let latency_ms = start.elapsed().as_millis() as i64;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                guard.release();
                excluded.insert(provider.id);
                log_attempt(
                    Some(provider.id), api_key_id, request_started, false, None, Some(latency_ms),
                    Some(e.to_string()), &TokenUsage::default(), None, Some(payload.to_string()), None,
                );
                continue;
            }
        };

        let status = response.status();
        let body_text = response.text().await.unwrap_or_default();

        if status.as_u16() >= 400 {
            guard.release();
            if is_quota_exhaustion(&body_text) {
                let _ = db::set_provider_active(provider.id, false);
                crate::logger::warn("engine", &format!("provider {} deactivated: quota exhausted", provider.id));
            }
            excluded.insert(provider.id);
            log_attempt(
                Some(provider.id), api_key_id, request_started, false, Some(status.as_u16() as i64),
                Some(latency_ms), Some(body_text.clone()), &TokenUsage::default(), None,
                Some(payload.to_string()), Some(body_text),
            );
            continue;
        }

        let parsed: Value = match serde_json::from_str(&body_text) {
            Ok(v) => v,
            Err(e) => {
                guard.release();
                excluded.insert(provider.id);
                log_attempt(
                    Some(provider.id), api_key_id, request_started, false, Some(status.as_u16() as i64),
                    Some(latency_ms), Some(format!("invalid json body: {e}")), &TokenUsage::default(), None,
                    Some(payload.to_string()), Some(body_text),
                );
                continue;
            }
        };

        let choices_empty = parsed
            .get("choices")
            .and_then(Value::as_array)
            .map(|c| c.is_empty())
            .unwrap_or(false);

        let keywords = db::list_active_keywords().unwrap_or_default();
        let lowercased = body_text.to_lowercase();
        let sentinel_hit = sentinel::find_match(&keywords, &lowercased).cloned();

        if choices_empty || sentinel_hit.is_some() {
            guard.release();
            if let Some(hit) = &sentinel_hit {
                let _ = db::mark_keyword_triggered(hit.id);
            }
            excluded.insert(provider.id);
            let reason = sentinel_hit
                .map(|k| format!("sentinel keyword matched: {}", k.keyword))
                .unwrap_or_else(|| "empty choices".to_string());
            log_attempt(
                Some(provider.id), api_key_id, request_started, false, Some(status.as_u16() as i64),
                Some(latency_ms), Some(reason), &TokenUsage::default(), None,
                Some(payload.to_string()), Some(body_text),
            );
            continue;
        }

        let usage = TokenUsage {
            prompt_tokens: parsed.pointer("/usage/prompt_tokens").and_then(Value::as_i64),
            completion_tokens: parsed.pointer("/usage/completion_tokens").and_then(Value::as_i64),
            total_tokens: parsed.pointer("/usage/total_tokens").and_then(Value::as_i64),
        };
        let cost = pricing::compute_cost(&provider, &usage);

        guard.release();
        log_attempt(
            Some(provider.id), api_key_id, request_started, true, Some(status.as_u16() as i64),
            Some(latency_ms), None, &usage, cost, Some(payload.to_string()), Some(body_text),
        );

        return Ok(parsed);
    }
}

/// Given one SSE `data:` payload's JSON body, elides `<think>` spans from
/// every choice's `delta.content` in place — stateful across calls via
/// `think_filter`, since a tag pair may straddle two upstream chunks — and
/// returns the frame to forward with every other field untouched, plus
/// whatever `usage` object it carried. Falls back to forwarding `data`
/// unchanged if it isn't a JSON object or carries no delta content.
fn process_chat_sse_frame(data: &str, think_filter: &mut ThinkFilter) -> (String, Option<TokenUsage>) {
    let Ok(mut parsed) = serde_json::from_str::<Value>(data) else {
        return (data.to_string(), None);
    };

    let usage = parsed.get("usage").map(|u| TokenUsage {
        prompt_tokens: u.get("prompt_tokens").and_then(Value::as_i64),
        completion_tokens: u.get("completion_tokens").and_then(Value::as_i64),
        total_tokens: u.get("total_tokens").and_then(Value::as_i64),
    });

    let mut mutated = false;
    if let Some(choices) = parsed.get_mut("choices").and_then(Value::as_array_mut) {
        for choice in choices.iter_mut() {
            let Some(content) = choice.pointer("/delta/content").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            let filtered = think_filter.filter(&content);
            if let Some(slot) = choice.pointer_mut("/delta/content") {
                *slot = Value::String(filtered);
                mutated = true;
            }
        }
    }

    let rendered = if mutated { parsed.to_string() } else { data.to_string() };
    (rendered, usage)
}

/// Runs the attempt loop against a streaming upstream and returns an axum
/// `Response` whose body forwards upstream SSE bytes as they arrive,
/// suppressing `<think>` blocks and retrying against another provider on the
/// first sentinel match or transport failure — invisibly to the client as
/// long as the bytes it has already received stay exactly as they were.
///
/// The retry loop itself runs inside a spawned task so it can keep writing
/// into the same response body across several provider attempts; this
/// function only waits for the first attempt to either connect (so it can
/// hand the caller a `Response`) or exhaust every candidate (so it can
/// return the same `ProxyError` a non-streaming caller would see).
pub async fn attempt_streaming(
    group: &str,
    api_key_id: Option<i64>,
    payload: Value,
    upstream_path: &str,
    timeout: Duration,
) -> ProxyResult<Response> {
    let (ready_tx, ready_rx) = oneshot::channel::<ProxyResult<()>>();
    let (tx, mut rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    let group = group.to_string();
    let upstream_path = upstream_path.to_string();
    tokio::spawn(run_chat_stream_attempts(group, api_key_id, payload, upstream_path, timeout, tx, Some(ready_tx)));

    match ready_rx.await {
        Ok(Ok(())) => {
            let stream = poll_fn(move |cx| rx.poll_recv(cx));
            let body = Body::from_stream(stream);
            Ok(Response::builder().header("content-type", "text/event-stream").body(body).unwrap())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProxyError::Exhausted),
    }
}

async fn run_chat_stream_attempts(
    group: String,
    api_key_id: Option<i64>,
    mut payload: Value,
    upstream_path: String,
    timeout: Duration,
    tx: ByteSender,
    mut ready_tx: Option<ReadySender>,
) {
    let mut excluded: HashSet<i64> = HashSet::new();
    let opts = selector_options();
    let client = http_client(timeout);
    let request_started = chrono::Utc::now().timestamp();

    loop {
        let Ok(Some((provider, membership))) = selector::select(&group, &excluded, &opts) else {
            log_attempt(
                None, api_key_id, request_started, false, Some(503), None,
                Some("no eligible provider".to_string()), &TokenUsage::default(), None, None, None,
            );
            if let Some(rt) = ready_tx.take() {
                let _ = rt.send(Err(ProxyError::Exhausted));
            } else {
                // Bytes already reached the client from an earlier attempt; the
                // dialect's own terminator is `[DONE]`, so emit it rather than
                // leaving the stream open forever.
                let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
            }
            return;
        };

        let guard = match ActiveCallGuard::acquire(provider.id, membership.group_id) {
            Ok(g) => g,
            Err(e) => {
                if let Some(rt) = ready_tx.take() {
                    let _ = rt.send(Err(ProxyError::UpstreamFailed(e.to_string())));
                }
                return;
            }
        };
        let start = Instant::now();

        if let Some(obj) = payload.as_object_mut() {
            obj.insert("model".to_string(), Value::String(provider.upstream_model.clone()));
            obj.insert("stream".to_string(), Value::Bool(true));
        }

        let url = format!("{}{}", provider.endpoint.trim_end_matches('/'), upstream_path);
        let response = match client.post(&url).bearer_auth(&provider.api_key).json(&payload).send().await {
            Ok(r) => r,
            Err(e) => {
                guard.release();
                excluded.insert(provider.id);
                log_attempt(
                    Some(provider.id), api_key_id, request_started, false, None,
                    Some(start.elapsed().as_millis() as i64), Some(e.to_string()),
                    &TokenUsage::default(), None, Some(payload.to_string()), None,
                );
                continue;
            }
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            let body_text = response.text().await.unwrap_or_default();
            guard.release();
            if is_quota_exhaustion(&body_text) {
                let _ = db::set_provider_active(provider.id, false);
            }
            excluded.insert(provider.id);
            log_attempt(
                Some(provider.id), api_key_id, request_started, false, Some(status.as_u16() as i64),
                Some(start.elapsed().as_millis() as i64), Some(body_text.clone()), &TokenUsage::default(),
                None, Some(payload.to_string()), Some(body_text),
            );
            continue;
        }

        // Connected: the client can now see this attempt's bytes.
        if let Some(rt) = ready_tx.take() {
            if rt.send(Ok(())).is_err() {
                guard.release();
                return;
            }
        }

        let keywords = db::list_active_keywords().unwrap_or_default();
        let mut upstream_bytes = response.bytes_stream();
        let mut buffer = Vec::new();
        let mut accumulated_lower = String::new();
        let mut think_filter = ThinkFilter::new();
        let mut last_usage = TokenUsage::default();
        let mut failed: Option<String> = None;
        let mut client_gone = false;

        'chunks: loop {
            use futures_util::StreamExt;
            let chunk = match upstream_bytes.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    failed = Some(e.to_string());
                    break;
                }
                None => break,
            };

            for line in drain_sse_lines(&mut buffer, &chunk) {
                let Some(data) = parse_sse_data(&line) else {
                    if tx.send(Ok(Bytes::from(format!("{line}\n")))).await.is_err() {
                        client_gone = true;
                        break 'chunks;
                    }
                    continue;
                };
                if is_sse_done(data) {
                    if tx.send(Ok(Bytes::from(format!("{line}\n")))).await.is_err() {
                        client_gone = true;
                        break 'chunks;
                    }
                    continue;
                }

                accumulated_lower.push_str(&data.to_lowercase());
                if let Some(hit) = sentinel::find_match(&keywords, &accumulated_lower) {
                    let _ = db::mark_keyword_triggered(hit.id);
                    failed = Some(format!("sentinel keyword matched: {}", hit.keyword));
                    break 'chunks;
                }

                let (rendered, usage) = process_chat_sse_frame(data, &mut think_filter);
                if let Some(usage) = usage {
                    last_usage = usage;
                }
                if tx.send(Ok(Bytes::from(format!("data: {rendered}\n")))).await.is_err() {
                    client_gone = true;
                    break 'chunks;
                }
            }
        }

        let cost = pricing::compute_cost(&provider, &last_usage);
        guard.release();

        if client_gone {
            log_attempt(
                Some(provider.id), api_key_id, request_started, false, Some(200),
                Some(start.elapsed().as_millis() as i64), Some("client disconnected".to_string()),
                &last_usage, cost, None, None,
            );
            return;
        }

        if let Some(reason) = failed {
            excluded.insert(provider.id);
            log_attempt(
                Some(provider.id), api_key_id, request_started, false, Some(200),
                Some(start.elapsed().as_millis() as i64), Some(reason), &last_usage, cost, None, None,
            );
            continue;
        }

        log_attempt(
            Some(provider.id), api_key_id, request_started, true, Some(200),
            Some(start.elapsed().as_millis() as i64), None, &last_usage, cost, None, None,
        );
        return;
    }
}

/// Same attempt loop as [`attempt_streaming`], but emits the fixed D-msg SSE
/// frame sequence (`message_start` ... `message_stop`) instead of forwarding
/// D-chat frames verbatim, for clients talking the messages dialect. The
/// `message_start`/`content_block_start` pair is emitted once, the first
/// time any provider connects; a mid-stream failover keeps appending
/// `content_block_delta` frames from the next attempt into the same block
/// rather than restarting the sequence.
pub async fn attempt_streaming_as_msg(
    group: &str,
    api_key_id: Option<i64>,
    payload: Value,
    model_label: &str,
    timeout: Duration,
) -> ProxyResult<Response> {
    let (ready_tx, ready_rx) = oneshot::channel::<ProxyResult<()>>();
    let (tx, mut rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    let group = group.to_string();
    let model_label = model_label.to_string();
    tokio::spawn(run_msg_stream_attempts(group, api_key_id, payload, model_label, timeout, tx, Some(ready_tx)));

    match ready_rx.await {
        Ok(Ok(())) => {
            let stream = poll_fn(move |cx| rx.poll_recv(cx));
            let body = Body::from_stream(stream);
            Ok(Response::builder().header("content-type", "text/event-stream").body(body).unwrap())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProxyError::Exhausted),
    }
}

async fn send_msg_terminal_frames(tx: &ByteSender, output_tokens: i64) {
    let _ = tx
        .send(Ok(Bytes::from(dialect::msg_sse_event("content_block_stop", &dialect::msg_content_block_stop_frame()))))
        .await;
    let _ = tx
        .send(Ok(Bytes::from(dialect::msg_sse_event("message_delta", &dialect::msg_message_delta_frame(output_tokens)))))
        .await;
    let _ = tx.send(Ok(Bytes::from(dialect::msg_sse_event("message_stop", &dialect::msg_message_stop_frame())))).await;
}

async fn run_msg_stream_attempts(
    group: String,
    api_key_id: Option<i64>,
    mut payload: Value,
    model_label: String,
    timeout: Duration,
    tx: ByteSender,
    mut ready_tx: Option<ReadySender>,
) {
    let mut excluded: HashSet<i64> = HashSet::new();
    let opts = selector_options();
    let client = http_client(timeout);
    let request_started = chrono::Utc::now().timestamp();
    let mut started = false;
    let mut last_usage = TokenUsage::default();

    loop {
        let Ok(Some((provider, membership))) = selector::select(&group, &excluded, &opts) else {
            log_attempt(
                None, api_key_id, request_started, false, Some(503), None,
                Some("no eligible provider".to_string()), &TokenUsage::default(), None, None, None,
            );
            if let Some(rt) = ready_tx.take() {
                let _ = rt.send(Err(ProxyError::Exhausted));
            } else {
                send_msg_terminal_frames(&tx, last_usage.completion_tokens.unwrap_or(0)).await;
            }
            return;
        };

        let guard = match ActiveCallGuard::acquire(provider.id, membership.group_id) {
            Ok(g) => g,
            Err(e) => {
                if let Some(rt) = ready_tx.take() {
                    let _ = rt.send(Err(ProxyError::UpstreamFailed(e.to_string())));
                }
                return;
            }
        };
        let start = Instant::now();

        if let Some(obj) = payload.as_object_mut() {
            obj.insert("model".to_string(), Value::String(provider.upstream_model.clone()));
            obj.insert("stream".to_string(), Value::Bool(true));
        }

        let url = format!("{}/chat/completions", provider.endpoint.trim_end_matches('/'));
        let response = match client.post(&url).bearer_auth(&provider.api_key).json(&payload).send().await {
            Ok(r) => r,
            Err(e) => {
                guard.release();
                excluded.insert(provider.id);
                log_attempt(
                    Some(provider.id), api_key_id, request_started, false, None,
                    Some(start.elapsed().as_millis() as i64), Some(e.to_string()),
                    &TokenUsage::default(), None, Some(payload.to_string()), None,
                );
                continue;
            }
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            let body_text = response.text().await.unwrap_or_default();
            guard.release();
            if is_quota_exhaustion(&body_text) {
                let _ = db::set_provider_active(provider.id, false);
            }
            excluded.insert(provider.id);
            log_attempt(
                Some(provider.id), api_key_id, request_started, false, Some(status.as_u16() as i64),
                Some(start.elapsed().as_millis() as i64), Some(body_text.clone()), &TokenUsage::default(),
                None, Some(payload.to_string()), Some(body_text),
            );
            continue;
        }

        if let Some(rt) = ready_tx.take() {
            if rt.send(Ok(())).is_err() {
                guard.release();
                return;
            }
        }
        if !started {
            let _ = tx
                .send(Ok(Bytes::from(dialect::msg_sse_event("message_start", &dialect::msg_message_start_frame(&model_label)))))
                .await;
            let _ = tx
                .send(Ok(Bytes::from(dialect::msg_sse_event("content_block_start", &dialect::msg_content_block_start_frame()))))
                .await;
            started = true;
        }

        let keywords = db::list_active_keywords().unwrap_or_default();
        let mut upstream_bytes = response.bytes_stream();
        let mut buffer = Vec::new();
        let mut accumulated_lower = String::new();
        let mut think_filter = ThinkFilter::new();
        let mut failed: Option<String> = None;
        let mut client_gone = false;

        'chunks: loop {
            use futures_util::StreamExt;
            let chunk = match upstream_bytes.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    failed = Some(e.to_string());
                    break;
                }
                None => break,
            };

            for line in drain_sse_lines(&mut buffer, &chunk) {
                let Some(data) = parse_sse_data(&line) else { continue };
                if is_sse_done(data) {
                    continue;
                }

                accumulated_lower.push_str(&data.to_lowercase());
                if let Some(hit) = sentinel::find_match(&keywords, &accumulated_lower) {
                    let _ = db::mark_keyword_triggered(hit.id);
                    failed = Some(format!("sentinel keyword matched: {}", hit.keyword));
                    break 'chunks;
                }

                let Ok(parsed) = serde_json::from_str::<Value>(data) else { continue };
                if let Some(usage) = parsed.get("usage") {
                    last_usage = TokenUsage {
                        prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_i64),
                        completion_tokens: usage.get("completion_tokens").and_then(Value::as_i64),
                        total_tokens: usage.get("total_tokens").and_then(Value::as_i64),
                    };
                }
                let Some(content) = parsed.pointer("/choices/0/delta/content").and_then(Value::as_str) else {
                    continue;
                };
                let forwarded = think_filter.filter(content);
                if forwarded.is_empty() {
                    continue;
                }
                let frame = dialect::msg_content_block_delta_frame(&forwarded);
                if tx.send(Ok(Bytes::from(dialect::msg_sse_event("content_block_delta", &frame)))).await.is_err() {
                    client_gone = true;
                    break 'chunks;
                }
            }
        }

        let cost = pricing::compute_cost(&provider, &last_usage);
        guard.release();

        if client_gone {
            log_attempt(
                Some(provider.id), api_key_id, request_started, false, Some(200),
                Some(start.elapsed().as_millis() as i64), Some("client disconnected".to_string()),
                &last_usage, cost, None, None,
            );
            return;
        }

        if let Some(reason) = failed {
            excluded.insert(provider.id);
            log_attempt(
                Some(provider.id), api_key_id, request_started, false, Some(200),
                Some(start.elapsed().as_millis() as i64), Some(reason), &last_usage, cost, None, None,
            );
            continue;
        }

        send_msg_terminal_frames(&tx, last_usage.completion_tokens.unwrap_or(0)).await;
        log_attempt(
            Some(provider.id), api_key_id, request_started, true, Some(200),
            Some(start.elapsed().as_millis() as i64), None, &last_usage, cost, None, None,
        );
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exhaustion_requires_both_substrings() {
        assert!(is_quota_exhaustion("Error: Insufficient Quota remaining"));
        assert!(is_quota_exhaustion("insufficient_quota"));
        assert!(!is_quota_exhaustion("insufficient balance"));
        assert!(!is_quota_exhaustion("quota exceeded"));
        assert!(!is_quota_exhaustion("rate limit exceeded"));
    }

    #[test]
    fn process_chat_sse_frame_elides_think_span_preserving_other_fields() {
        let mut filter = ThinkFilter::new();
        let data = r#"{"id":"1","model":"m","choices":[{"index":0,"delta":{"content":"a<think>hidden</think>b"},"finish_reason":null}]}"#;
        let (rendered, usage) = process_chat_sse_frame(data, &mut filter);
        assert!(usage.is_none());
        let parsed: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["id"], "1");
        assert_eq!(parsed["choices"][0]["delta"]["content"], "ab");
        assert_eq!(parsed["choices"][0]["finish_reason"], Value::Null);
    }

    #[test]
    fn process_chat_sse_frame_strips_think_span_across_calls() {
        let mut filter = ThinkFilter::new();
        let first = r#"{"choices":[{"delta":{"content":"keep<think>hid"}}]}"#;
        let second = r#"{"choices":[{"delta":{"content":"den</think>me"}}]}"#;
        let (rendered1, _) = process_chat_sse_frame(first, &mut filter);
        let (rendered2, _) = process_chat_sse_frame(second, &mut filter);
        let parsed1: Value = serde_json::from_str(&rendered1).unwrap();
        let parsed2: Value = serde_json::from_str(&rendered2).unwrap();
        assert_eq!(parsed1["choices"][0]["delta"]["content"], "keep");
        assert_eq!(parsed2["choices"][0]["delta"]["content"], "me");
    }

    #[test]
    fn process_chat_sse_frame_captures_usage_and_passes_non_delta_frames_through() {
        let mut filter = ThinkFilter::new();
        let data = r#"{"choices":[{"delta":{"role":"assistant"}}],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#;
        let (rendered, usage) = process_chat_sse_frame(data, &mut filter);
        assert_eq!(rendered, data);
        let usage = usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(3));
        assert_eq!(usage.total_tokens, Some(7));
    }

    #[test]
    fn process_chat_sse_frame_falls_back_on_non_json() {
        let mut filter = ThinkFilter::new();
        let (rendered, usage) = process_chat_sse_frame("[DONE]", &mut filter);
        assert_eq!(rendered, "[DONE]");
        assert!(usage.is_none());
    }

    #[test]
    fn selector_options_default_off_with_no_settings() {
        let dir = std::env::temp_dir().join(format!(
            "gw-engine-test-{}-{}.db",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().subsec_nanos()
        ));
        std::env::set_var("GATEWAY_DB_PATH", dir.to_str().unwrap());
        db::init();

        let opts = selector_options();
        assert!(!opts.health_filter_enabled);
        assert_eq!(opts.failover_threshold_count, None);
        assert_eq!(opts.failover_threshold_period_minutes, None);
    }

    #[tokio::test]
    async fn non_streaming_attempt_exhausts_with_no_memberships() {
        let dir = std::env::temp_dir().join(format!(
            "gw-engine-test-exhaust-{}-{}.db",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().subsec_nanos()
        ));
        std::env::set_var("GATEWAY_DB_PATH", dir.to_str().unwrap());
        db::init();
        db::create_group("empty-group").unwrap();

        let result = attempt_non_streaming(
            "empty-group",
            None,
            serde_json::json!({ "model": "empty-group", "messages": [] }),
            "/chat/completions",
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(ProxyError::Exhausted)));
    }

    #[tokio::test]
    async fn non_streaming_attempt_reports_no_candidate_for_unknown_group() {
        let dir = std::env::temp_dir().join(format!(
            "gw-engine-test-unknown-{}-{}.db",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().subsec_nanos()
        ));
        std::env::set_var("GATEWAY_DB_PATH", dir.to_str().unwrap());
        db::init();

        let result = attempt_non_streaming(
            "does-not-exist",
            None,
            serde_json::json!({ "model": "does-not-exist", "messages": [] }),
            "/chat/completions",
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(ProxyError::Exhausted)));
    }

    #[tokio::test]
    async fn streaming_attempt_exhausts_with_no_memberships() {
        let dir = std::env::temp_dir().join(format!(
            "gw-engine-test-stream-exhaust-{}-{}.db",
            std::process::id(),
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().subsec_nanos()
        ));
        std::env::set_var("GATEWAY_DB_PATH", dir.to_str().unwrap());
        db::init();
        db::create_group("empty-group").unwrap();

        let result = attempt_streaming(
            "empty-group",
            None,
            serde_json::json!({ "model": "empty-group", "messages": [], "stream": true }),
            "/chat/completions",
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(ProxyError::Exhausted)));
    }
}

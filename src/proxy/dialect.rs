//! Dialect translator (C3).
//!
//! D-chat is the internal canonical shape (OpenAI chat-completions). D-compl
//! is the legacy single-prompt form. D-msg is the third-party messaging
//! form; requests are translated D-msg → D-chat before dispatch, and
//! responses are translated back D-chat → D-msg (both non-streaming and via
//! the fixed SSE frame sequence for streaming).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use super::sse::ThinkFilter;

static THINK_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<think>.*?</think>").unwrap());

/// Strips every `<think>...</think>` span (greedy, non-overlapping, dot
/// matches newline) from a string, trimming surrounding whitespace.
pub fn strip_think_blocks(content: &str) -> String {
    THINK_BLOCK.replace_all(content, "").trim().to_string()
}

/// Keeps only the standard D-chat response fields, and strips `<think>`
/// spans from each choice's message content.
pub fn sanitize_chat_response(mut response: Value) -> Value {
    let Some(obj) = response.as_object_mut() else {
        return response;
    };

    let mut clean = serde_json::Map::new();
    for key in ["id", "object", "created", "model", "choices", "usage", "system_fingerprint"] {
        if let Some(v) = obj.remove(key) {
            clean.insert(key.to_string(), v);
        }
    }

    if let Some(Value::Array(choices)) = clean.get_mut("choices") {
        for choice in choices.iter_mut() {
            let Some(choice_obj) = choice.as_object_mut() else { continue };
            if let Some(Value::Object(message)) = choice_obj.get_mut("message") {
                let mut clean_message = serde_json::Map::new();
                for key in ["role", "content", "tool_calls", "function_call", "name"] {
                    if let Some(v) = message.remove(key) {
                        clean_message.insert(key.to_string(), v);
                    }
                }
                if let Some(Value::String(content)) = clean_message.get("content") {
                    let stripped = strip_think_blocks(content);
                    clean_message.insert("content".to_string(), Value::String(stripped));
                }
                choice_obj.insert("message".to_string(), Value::Object(clean_message));
            }
        }
    }

    Value::Object(clean)
}

/// D-msg content block: either plain text or a typed list of `{type, text}`.
fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("type").and_then(Value::as_str).filter(|t| *t == "text").and(b.get("text")).and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// Converts a D-msg request body into the internal D-chat shape.
pub fn msg_to_chat_request(msg: &Value) -> Value {
    let mut messages = Vec::new();

    if let Some(system) = msg.get("system") {
        let system_text = flatten_content(system);
        if !system_text.trim().is_empty() {
            messages.push(json!({ "role": "system", "content": system_text }));
        }
    }

    if let Some(Value::Array(msgs)) = msg.get("messages") {
        for m in msgs {
            let role = m.get("role").and_then(Value::as_str).unwrap_or("user");
            let content = m.get("content").map(flatten_content).unwrap_or_default();
            messages.push(json!({ "role": role, "content": content }));
        }
    }

    let mut chat = json!({
        "model": msg.get("model").cloned().unwrap_or(Value::Null),
        "messages": messages,
    });
    if let Some(stream) = msg.get("stream") {
        chat["stream"] = stream.clone();
    }
    if let Some(max_tokens) = msg.get("max_tokens") {
        chat["max_tokens"] = max_tokens.clone();
    }
    chat
}

fn assistant_text_from_chat_response(response: &Value) -> String {
    response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

/// Non-streaming D-chat → D-msg conversion.
pub fn chat_response_to_msg(response: &Value, model: &str) -> Value {
    let text = assistant_text_from_chat_response(response);
    let prompt_tokens = response.pointer("/usage/prompt_tokens").cloned().unwrap_or(Value::from(0));
    let completion_tokens = response.pointer("/usage/completion_tokens").cloned().unwrap_or(Value::from(0));

    json!({
        "id": response.get("id").cloned().unwrap_or(Value::Null),
        "type": "message",
        "role": "assistant",
        "content": [{ "type": "text", "text": text }],
        "model": model,
        "stop_reason": "end_turn",
        "usage": {
            "input_tokens": prompt_tokens,
            "output_tokens": completion_tokens,
        },
    })
}

/// One SSE `event: <type>\ndata: <json>\n\n` frame of the fixed D-msg
/// streaming sequence. The engine emits these one at a time as the upstream
/// produces deltas (possibly across several provider attempts after a
/// mid-stream failover), rather than building the whole sequence up front.
pub fn msg_sse_event(event_type: &str, data: &Value) -> String {
    format!("event: {event_type}\ndata: {data}\n\n")
}

pub fn msg_message_start_frame(model: &str) -> Value {
    json!({
        "type": "message_start",
        "message": {
            "id": "msg_stream",
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": [],
            "usage": { "input_tokens": 0, "output_tokens": 0 },
        }
    })
}

pub fn msg_content_block_start_frame() -> Value {
    json!({ "type": "content_block_start", "index": 0, "content_block": { "type": "text", "text": "" } })
}

pub fn msg_content_block_delta_frame(text: &str) -> Value {
    json!({ "type": "content_block_delta", "index": 0, "delta": { "type": "text_delta", "text": text } })
}

pub fn msg_content_block_stop_frame() -> Value {
    json!({ "type": "content_block_stop", "index": 0 })
}

pub fn msg_message_delta_frame(output_tokens: i64) -> Value {
    json!({ "type": "message_delta", "delta": { "stop_reason": "end_turn" }, "usage": { "output_tokens": output_tokens } })
}

pub fn msg_message_stop_frame() -> Value {
    json!({ "type": "message_stop" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_single_think_block() {
        assert_eq!(strip_think_blocks("a <think>reasoning</think> b"), "a  b");
    }

    #[test]
    fn strips_multiline_think_block() {
        let input = "before<think>line1\nline2</think>after";
        assert_eq!(strip_think_blocks(input), "beforeafter");
    }

    #[test]
    fn sanitizer_drops_nonstandard_fields() {
        let response = json!({
            "id": "1", "object": "chat.completion", "created": 1, "model": "m",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": "hi", "extra": "drop-me" } }],
            "usage": {}, "weird_extra_field": true,
        });
        let clean = sanitize_chat_response(response);
        assert!(clean.get("weird_extra_field").is_none());
        let message = &clean["choices"][0]["message"];
        assert!(message.get("extra").is_none());
        assert_eq!(message["content"], "hi");
        assert_eq!(clean["choices"][0]["index"], 0);
    }

    #[test]
    fn msg_to_chat_flattens_system_and_blocks() {
        let msg = json!({
            "model": "claude-3",
            "system": [{ "type": "text", "text": "be helpful" }],
            "messages": [{ "role": "user", "content": [{ "type": "text", "text": "hi" }, { "type": "text", "text": "there" }] }],
        });
        let chat = msg_to_chat_request(&msg);
        assert_eq!(chat["messages"][0]["role"], "system");
        assert_eq!(chat["messages"][0]["content"], "be helpful");
        assert_eq!(chat["messages"][1]["content"], "hi there");
    }

    #[test]
    fn chat_response_to_msg_builds_expected_shape() {
        let response = json!({
            "id": "abc",
            "choices": [{ "message": { "content": "hello" } }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 2 },
        });
        let msg = chat_response_to_msg(&response, "claude-3");
        assert_eq!(msg["type"], "message");
        assert_eq!(msg["content"][0]["text"], "hello");
        assert_eq!(msg["usage"]["input_tokens"], 5);
    }

    #[test]
    fn stream_frames_assemble_into_fixed_sequence() {
        let frames = vec![
            msg_message_start_frame("claude-3"),
            msg_content_block_start_frame(),
            msg_content_block_delta_frame("hello"),
            msg_content_block_delta_frame(" world"),
            msg_content_block_stop_frame(),
            msg_message_delta_frame(2),
            msg_message_stop_frame(),
        ];
        let types: Vec<_> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
        assert_eq!(
            types,
            vec!["message_start", "content_block_start", "content_block_delta", "content_block_delta", "content_block_stop", "message_delta", "message_stop"]
        );
    }

    #[test]
    fn sse_event_frames_type_and_data() {
        let frame = msg_sse_event("message_stop", &msg_message_stop_frame());
        assert_eq!(frame, "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
    }
}

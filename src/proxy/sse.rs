//! SSE framing helpers shared by the streaming attempt path.

/// Parse a single SSE line, returning the `data:` payload if present.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Drains complete lines from a byte buffer, carrying any partial trailing
/// line over to the next call. Handles both `\n` and `\r\n` terminators.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }

    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }
    lines
}

/// Stateful `<think>...</think>` suppression across an arbitrary chunk
/// sequence: the tag pair need not land in the same chunk. Bytes before the
/// opening tag and after the closing tag are forwarded; everything between
/// is dropped. Returns the bytes that should be forwarded downstream.
#[derive(Default)]
pub struct ThinkFilter {
    in_think_block: bool,
}

impl ThinkFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(&mut self, chunk: &str) -> String {
        const OPEN: &str = "<think>";
        const CLOSE: &str = "</think>";
        let mut out = String::new();
        let mut rest = chunk;

        loop {
            if self.in_think_block {
                match rest.find(CLOSE) {
                    Some(idx) => {
                        rest = &rest[idx + CLOSE.len()..];
                        self.in_think_block = false;
                    }
                    None => return out,
                }
            } else {
                match rest.find(OPEN) {
                    Some(idx) => {
                        out.push_str(&rest[..idx]);
                        rest = &rest[idx + OPEN.len()..];
                        self.in_think_block = true;
                    }
                    None => {
                        out.push_str(rest);
                        return out;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_sse_lines_handles_partial_chunks() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: {\"id\":");
        assert!(lines.is_empty());
        let lines = drain_sse_lines(&mut buffer, b"1}\n");
        assert_eq!(lines, vec!["data: {\"id\":1}"]);
    }

    #[test]
    fn drain_sse_lines_strips_crlf() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: ok\r\n");
        assert_eq!(lines, vec!["data: ok"]);
    }

    #[test]
    fn parse_sse_data_strips_prefix_and_space() {
        assert_eq!(parse_sse_data("data: hello"), Some("hello"));
        assert_eq!(parse_sse_data("data:hello"), Some("hello"));
        assert_eq!(parse_sse_data("event: x"), None);
    }

    #[test]
    fn think_filter_strips_tag_within_one_chunk() {
        let mut f = ThinkFilter::new();
        assert_eq!(f.filter("before<think>hidden</think>after"), "beforeafter");
    }

    #[test]
    fn think_filter_strips_tag_across_chunks() {
        let mut f = ThinkFilter::new();
        let mut out = String::new();
        out.push_str(&f.filter("before<think>hid"));
        out.push_str(&f.filter("den</think>after"));
        assert_eq!(out, "beforeafter");
    }

    #[test]
    fn think_filter_passes_through_plain_text() {
        let mut f = ThinkFilter::new();
        assert_eq!(f.filter("no tags here"), "no tags here");
    }
}

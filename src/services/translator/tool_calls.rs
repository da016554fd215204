//! Parser for text-form tool calls.
//!
//! Upstreams without native tool calling are prompted (see the injected
//! template in the translator) to emit fragments of the form:
//!
//! ```text
//! <tool_call>
//! <function=get_weather>
//! <parameter=city>Lisbon</parameter>
//! </function>
//! </tool_call>
//! ```
//!
//! Models are sloppy about closing tags, so `</function>` alone or a final
//! `</parameter>` also terminate a call.

use serde_json::{json, Map, Value};

use crate::models::canonical::StreamEvent;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    pub arguments: Value,
}

pub fn contains_tool_call(content: &str) -> bool {
    content.contains("<tool_call>") || content.contains("<function=")
}

pub fn has_complete_tool_call(content: &str) -> bool {
    content.contains("</tool_call>")
        || content.contains("</function>")
        || (content.contains("<function=") && content.contains("</parameter>"))
}

/// Extracts every complete tool call and returns the surrounding text with
/// the fragments removed.
pub fn parse_tool_calls(content: &str) -> (Vec<ParsedToolCall>, String) {
    let mut calls = Vec::new();
    let mut remaining = content.to_string();

    loop {
        let start = match fragment_start(&remaining) {
            Some(start) => start,
            None => break,
        };
        let skip = if remaining[start..].starts_with("<tool_call>") {
            "<tool_call>".len()
        } else {
            0
        };
        let search_from = start + skip;
        let Some(end_offset) = fragment_end(&remaining[search_from..]) else {
            break;
        };
        let end = search_from + end_offset;

        if let Some(call) = parse_single(&remaining[search_from..end]) {
            calls.push(call);
        }

        remaining = format!(
            "{}{}",
            remaining[..start].trim_end(),
            remaining[end..].trim_start()
        );
    }

    (calls, remaining.trim().to_string())
}

fn fragment_start(content: &str) -> Option<usize> {
    match (content.find("<tool_call>"), content.find("<function=")) {
        (Some(t), Some(f)) => Some(t.min(f)),
        (Some(t), None) => Some(t),
        (None, Some(f)) => Some(f),
        (None, None) => None,
    }
}

fn fragment_end(content: &str) -> Option<usize> {
    if let Some(pos) = content.find("</tool_call>") {
        return Some(pos + "</tool_call>".len());
    }
    if let Some(pos) = content.find("</function>") {
        return Some(pos + "</function>".len());
    }
    content
        .rfind("</parameter>")
        .map(|pos| pos + "</parameter>".len())
}

fn parse_single(content: &str) -> Option<ParsedToolCall> {
    let func_start = content.find("<function=")?;
    let name_start = func_start + "<function=".len();
    let rest = &content[name_start..];
    let name_end = rest.find('>').or_else(|| rest.find(char::is_whitespace))?;
    let name = rest[..name_end].trim();
    if name.is_empty() {
        return None;
    }

    let mut arguments = Map::new();
    let mut cursor = 0;
    while let Some(param_offset) = content[cursor..].find("<parameter=") {
        let param_name_start = cursor + param_offset + "<parameter=".len();
        let rest = &content[param_name_start..];
        let Some(rel_end) = rest.find('>').or_else(|| rest.find(char::is_whitespace)) else {
            break;
        };
        let param_name = rest[..rel_end].trim();
        let value_start = match content[param_name_start + rel_end..].find('>') {
            Some(p) => param_name_start + rel_end + p + 1,
            None => break,
        };
        let value_end = content[value_start..]
            .find("</parameter>")
            .map_or(content.len(), |p| value_start + p);
        let raw = content[value_start..value_end].trim();

        // JSON where it parses, string otherwise.
        let value = serde_json::from_str(raw).unwrap_or_else(|_| json!(raw));
        arguments.insert(param_name.to_string(), value);

        cursor = content[value_end..]
            .find("</parameter>")
            .map_or(value_end, |p| value_end + p + "</parameter>".len());
    }

    Some(ParsedToolCall {
        name: name.to_string(),
        arguments: Value::Object(arguments),
    })
}

// ============================================================================
// Streaming scanner
// ============================================================================

/// Incremental scanner applied to content deltas when the request declared
/// tools. Text flows through untouched until a fragment marker appears; the
/// fragment is then buffered until complete and emitted as one `ToolUse`
/// event.
#[derive(Default)]
pub struct ToolCallScanner {
    buffer: String,
    call_seq: u32,
}

impl ToolCallScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one content delta; returns the events to forward downstream.
    pub fn push(&mut self, delta: &str) -> Vec<StreamEvent> {
        self.buffer.push_str(delta);
        self.drain(false)
    }

    /// Flush at end of stream; incomplete fragments degrade to plain text.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        self.drain(true)
    }

    fn drain(&mut self, at_end: bool) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        loop {
            if !contains_tool_call(&self.buffer) {
                // Hold back a partial opening marker at the buffer tail so a
                // tag split across deltas is not leaked as text.
                let safe_len = if at_end {
                    self.buffer.len()
                } else {
                    self.buffer.len() - partial_marker_len(&self.buffer)
                };
                if safe_len > 0 {
                    let text: String = self.buffer.drain(..safe_len).collect();
                    events.push(StreamEvent::Content(text));
                }
                break;
            }

            if !has_complete_tool_call(&self.buffer) {
                if at_end {
                    // Truncated fragment: surface whatever text we have.
                    let text = std::mem::take(&mut self.buffer);
                    events.push(StreamEvent::Content(text));
                }
                break;
            }

            let (calls, remaining) = parse_tool_calls(&self.buffer);
            let before_len = self.buffer.len();
            for call in calls {
                self.call_seq += 1;
                events.push(StreamEvent::ToolUse {
                    id: format!("call_{}", self.call_seq),
                    name: call.name,
                    input: call.arguments,
                });
            }
            self.buffer = remaining;
            if self.buffer.len() == before_len {
                break;
            }
        }

        events
    }
}

/// Length of a trailing prefix of `<tool_call>` or `<function=` at the end
/// of the buffer, if any.
fn partial_marker_len(buffer: &str) -> usize {
    let max_check = "<tool_call>".len().min(buffer.len());
    for len in (1..=max_check).rev() {
        if !buffer.is_char_boundary(buffer.len() - len) {
            continue;
        }
        let tail = &buffer[buffer.len() - len..];
        if "<tool_call>".starts_with(tail) || "<function=".starts_with(tail) {
            return len;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_fragment() {
        let content = "<tool_call>\n<function=calculator>\n<parameter=expr>2+2</parameter>\n</function>\n</tool_call>";
        let (calls, remaining) = parse_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "calculator");
        assert_eq!(calls[0].arguments["expr"], "2+2");
        assert!(remaining.is_empty());
    }

    #[test]
    fn parses_multiple_parameters_with_json_values() {
        let content = "<function=search>\n<parameter=query>rust sse</parameter>\n<parameter=limit>5</parameter>\n</function>";
        let (calls, _) = parse_tool_calls(content);
        assert_eq!(calls[0].arguments["query"], "rust sse");
        assert_eq!(calls[0].arguments["limit"], 5);
    }

    #[test]
    fn keeps_surrounding_text() {
        let content = "Let me check.\n<tool_call>\n<function=lookup>\n<parameter=q>x</parameter>\n</function>\n</tool_call>";
        let (calls, remaining) = parse_tool_calls(content);
        assert_eq!(calls.len(), 1);
        assert_eq!(remaining, "Let me check.");
    }

    #[test]
    fn tolerates_missing_tool_call_wrapper() {
        let content = "<function=read>\n<parameter=path>README.md</parameter>\n</function>";
        let (calls, remaining) = parse_tool_calls(content);
        assert_eq!(calls[0].name, "read");
        assert_eq!(calls[0].arguments["path"], "README.md");
        assert!(remaining.is_empty());
    }

    #[test]
    fn scanner_passes_plain_text_through() {
        let mut scanner = ToolCallScanner::new();
        let events = scanner.push("Hello world");
        assert_eq!(events, vec![StreamEvent::Content("Hello world".to_string())]);
        assert!(scanner.finish().is_empty());
    }

    #[test]
    fn scanner_assembles_fragment_split_across_deltas() {
        let mut scanner = ToolCallScanner::new();
        let mut events = Vec::new();
        for delta in [
            "Sure. <tool_",
            "call>\n<function=get_weather>\n<parameter=city>Lis",
            "bon</parameter>\n</function>\n</tool_call>",
        ] {
            events.extend(scanner.push(delta));
        }
        events.extend(scanner.finish());

        assert_eq!(events[0], StreamEvent::Content("Sure. ".to_string()));
        assert_eq!(
            events[1],
            StreamEvent::ToolUse {
                id: "call_1".to_string(),
                name: "get_weather".to_string(),
                input: serde_json::json!({"city": "Lisbon"}),
            }
        );
    }

    #[test]
    fn scanner_degrades_truncated_fragment_to_text() {
        let mut scanner = ToolCallScanner::new();
        let mut events = scanner.push("<tool_call>\n<function=half");
        events.extend(scanner.finish());
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Content(text) if text.contains("<function=half")));
    }
}

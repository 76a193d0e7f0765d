//! Events from the Claude CLI's stream-json output format.
//!
//! The CLI emits one JSON document per line. Tool-call events arrive
//! interleaved with free text, and some lines are not JSON at all (stderr
//! noise, partial writes), so [`parse_stream_line`] is total: anything
//! unparseable is handed back as plain text.

use crate::state::TokenUsage;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        usage: Option<UsageBlock>,
        #[serde(default)]
        num_turns: Option<u64>,
    },

    #[serde(rename = "system")]
    System { subtype: String },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct UsageBlock {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl UsageBlock {
    pub fn to_token_usage(self, num_turns: Option<u64>) -> TokenUsage {
        TokenUsage {
            estimated_input: None,
            actual_input: Some(self.input_tokens),
            output: Some(self.output_tokens),
            cache_creation: Some(self.cache_creation_input_tokens),
            cache_read: Some(self.cache_read_input_tokens),
            thinking: None,
            num_turns,
        }
    }
}

/// Parse one output line. `Err` carries the raw line back so callers can
/// accumulate it as free text.
pub fn parse_stream_line(line: &str) -> Result<StreamEvent, &str> {
    serde_json::from_str::<StreamEvent>(line).map_err(|_| line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_assistant_text() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello"}]},"session_id":"abc"}"#;
        let event = parse_stream_line(json).unwrap();
        match event {
            StreamEvent::Assistant { message, .. } => match &message.content[0] {
                ContentBlock::Text { text } => assert_eq!(text, "Hello"),
                other => panic!("expected text block, got {other:?}"),
            },
            other => panic!("expected assistant event, got {other:?}"),
        }
    }

    #[test]
    fn parses_tool_use() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Write","input":{"file_path":"/x.rs"},"id":"1"}]}}"#;
        let event = parse_stream_line(json).unwrap();
        match event {
            StreamEvent::Assistant { message, .. } => {
                assert!(matches!(
                    message.content[0],
                    ContentBlock::ToolUse { ref name, .. } if name == "Write"
                ));
            }
            other => panic!("expected assistant event, got {other:?}"),
        }
    }

    #[test]
    fn parses_result_with_usage() {
        let json = r#"{"type":"result","subtype":"success","result":"All done","is_error":false,"usage":{"input_tokens":100,"output_tokens":42,"cache_read_input_tokens":7},"num_turns":3}"#;
        let event = parse_stream_line(json).unwrap();
        match event {
            StreamEvent::Result {
                result,
                is_error,
                usage,
                num_turns,
                ..
            } => {
                assert_eq!(result.as_deref(), Some("All done"));
                assert!(!is_error);
                let usage = usage.unwrap().to_token_usage(num_turns);
                assert_eq!(usage.actual_input, Some(100));
                assert_eq!(usage.output, Some(42));
                assert_eq!(usage.cache_read, Some(7));
                assert_eq!(usage.num_turns, Some(3));
            }
            other => panic!("expected result event, got {other:?}"),
        }
    }

    #[test]
    fn non_json_lines_come_back_verbatim() {
        assert_eq!(
            parse_stream_line("plain stderr noise").unwrap_err(),
            "plain stderr noise"
        );
        assert_eq!(parse_stream_line("{truncated").unwrap_err(), "{truncated");
    }

    #[test]
    fn unknown_event_type_is_not_json_panic() {
        // Tagged enum rejects unknown tags; the raw line is preserved.
        assert!(parse_stream_line(r#"{"type":"telemetry","x":1}"#).is_err());
    }
}

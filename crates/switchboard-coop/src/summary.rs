//! Session summaries, transcript formatting and message content parsing

use serde::Serialize;
use serde_json::Value;
use switchboard_core::{AgentMessage, MessageType, SessionCooperationState};
use tracing::warn;

/// Phrases that mark a message as a takeaway worth surfacing
const INSIGHT_MARKERS: [&str; 3] = ["summary", "conclusion", "key point"];

/// Condensed view of a session's conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Content of the first message
    pub task_description: String,
    pub key_insights: Vec<String>,
    /// Distinct senders in order of first appearance
    pub participating_agents: Vec<String>,
    /// Time between first and last message
    pub duration_ms: i64,
    pub message_count: usize,
}

impl SessionSummary {
    pub fn from_state(state: &SessionCooperationState) -> Self {
        Self::from_messages(&state.messages)
    }

    pub fn from_messages(messages: &[AgentMessage]) -> Self {
        let mut participating_agents: Vec<String> = Vec::new();
        for message in messages {
            if !participating_agents.contains(&message.sender_id) {
                participating_agents.push(message.sender_id.clone());
            }
        }

        let duration_ms = match (messages.first(), messages.last()) {
            (Some(first), Some(last)) if messages.len() >= 2 => {
                (last.created_at - first.created_at).num_milliseconds()
            }
            _ => 0,
        };

        let key_insights = messages
            .iter()
            .filter(|m| {
                let content = m.content.to_lowercase();
                INSIGHT_MARKERS.iter().any(|marker| content.contains(marker))
            })
            .map(|m| m.content.clone())
            .collect();

        Self {
            task_description: messages.first().map(|m| m.content.clone()).unwrap_or_default(),
            key_insights,
            participating_agents,
            duration_ms,
            message_count: messages.len(),
        }
    }
}

/// Render a message body for a transcript, tagged by type
pub fn format_message(message: &AgentMessage) -> String {
    match message.message_type {
        MessageType::Code => format!("```\n{}\n```", message.content),
        MessageType::ToolCall => format!("[tool call] {}", message.content),
        MessageType::ToolResult => format!("[tool result] {}", message.content),
        MessageType::Error => format!("[error] {}", message.content),
        MessageType::Text => message.content.clone(),
    }
}

/// Opening marker of an inline tool call: `[TOOL_CALL:name{"key": "value"}]`
const TOOL_CALL_MARKER: &str = "[TOOL_CALL:";

/// A fenced code block found in a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeBlock {
    /// Info string of the fence, `text` when absent
    pub language: String,
    pub content: String,
}

/// An inline tool call found in a message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub name: String,
    /// Parsed arguments; an empty object when they are not valid JSON
    pub params: Value,
}

/// Structured view of a message body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedContent {
    /// The unmodified content
    pub text: String,
    pub code: Vec<CodeBlock>,
    pub tool_calls: Vec<ToolCall>,
}

/// Extract fenced code blocks and inline tool calls from message content
pub fn parse_message_content(content: &str) -> ParsedContent {
    ParsedContent {
        text: content.to_string(),
        code: code_blocks(content),
        tool_calls: tool_calls(content),
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn code_blocks(content: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut pos = 0;
    while let Some(found) = content[pos..].find("```") {
        let open = pos + found;
        let after = &content[open + 3..];
        let lang_len = after.find(|c: char| !is_word_char(c)).unwrap_or(after.len());
        let language = &after[..lang_len];

        // The body starts after the last newline of the whitespace run that
        // follows the info string
        let header = &after[lang_len..];
        let ws_len = header
            .find(|c: char| !c.is_whitespace())
            .unwrap_or(header.len());
        let Some(newline) = header[..ws_len].rfind('\n') else {
            pos = open + 3;
            continue;
        };
        let body = &header[newline + 1..];
        let Some(close) = body.find("\n```") else {
            pos = open + 3;
            continue;
        };

        blocks.push(CodeBlock {
            language: if language.is_empty() { "text" } else { language }.to_string(),
            content: body[..close].to_string(),
        });
        let body_offset = content.len() - body.len();
        pos = body_offset + close + 4;
    }
    blocks
}

fn tool_calls(content: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut pos = 0;
    while let Some(found) = content[pos..].find(TOOL_CALL_MARKER) {
        let start = pos + found;
        pos = start + 1;

        let rest = &content[start + TOOL_CALL_MARKER.len()..];
        let name_len = rest.find(|c: char| !is_word_char(c)).unwrap_or(rest.len());
        if name_len == 0 || !rest[name_len..].starts_with('{') {
            continue;
        }
        let args_start = name_len + 1;
        let Some(args_len) = rest[args_start..].find('}') else {
            continue;
        };
        if args_len == 0 || !rest[args_start + args_len + 1..].starts_with(']') {
            continue;
        }

        let name = &rest[..name_len];
        let args = &rest[args_start..args_start + args_len];
        let params = match serde_json::from_str::<Value>(&format!("{{{}}}", args)) {
            Ok(params) => params,
            Err(e) => {
                warn!("Could not parse arguments of tool call '{}': {}", name, e);
                Value::Object(Default::default())
            }
        };
        calls.push(ToolCall {
            name: name.to_string(),
            params,
        });
        pos = start + TOOL_CALL_MARKER.len() + args_start + args_len + 2;
    }
    calls
}

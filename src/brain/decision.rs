//! 决策与推理输出解析
//!
//! 工具调用约定：`{"tool": "名称", "args": {...}, "rationale": "..."}`，或其数组，
//! 或放在 ```json 代码块里；JSON 之外的部分视为自由文本。没有 JSON 时整段都是自由文本。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::AgentError;

/// 推理后端给出的一条决策；执行器按值消费，只执行一次
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl Decision {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            arguments: Map::new(),
            rationale: None,
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

/// 一次推理的结果：零到多条决策 + 可选自由文本
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReasoningOutput {
    pub decisions: Vec<Decision>,
    pub text: Option<String>,
}

/// 线上格式：tool/action 与 args/arguments 两种写法都接受
#[derive(Deserialize)]
struct ToolCall {
    #[serde(alias = "action")]
    tool: String,
    #[serde(default, alias = "arguments")]
    args: Value,
    #[serde(default)]
    rationale: Option<String>,
}

impl ToolCall {
    fn into_decision(self) -> Option<Decision> {
        let tool = self.tool.trim().to_string();
        if tool.is_empty() {
            return None;
        }
        let arguments = match self.args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Some(Decision {
            action: tool,
            arguments,
            rationale: self.rationale,
        })
    }
}

/// 一个 JSON 值里的工具调用：单个对象或对象数组
fn tool_calls(value: Value) -> Vec<Decision> {
    let items = match value {
        Value::Array(items) => items,
        obj @ Value::Object(_) => vec![obj],
        _ => return Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|v| serde_json::from_value::<ToolCall>(v).ok())
        .filter_map(ToolCall::into_decision)
        .collect()
}

/// `{` 后紧跟 "tool" / "action" 键：作者显然想写工具调用
fn opens_tool_call(s: &str) -> bool {
    let inner = s[1..].trim_start();
    inner.starts_with("\"tool\"") || inner.starts_with("\"action\"")
}

fn normalize_text(text: &str) -> Option<String> {
    let t = text.trim();
    (!t.is_empty()).then(|| t.to_string())
}

/// 逐个 `{` / `[` 位置尝试解析 JSON 值；能给出工具调用的值成为决策，其余部分是自由文本。
/// 解析成功但不是工具调用的值整体跳过，内部的括号不再单独尝试。
pub fn parse_reasoning_output(output: &str) -> Result<ReasoningOutput, AgentError> {
    let trimmed = output.trim();
    let mut decisions = Vec::new();
    let mut text = String::new();
    let mut malformed: Option<String> = None;
    let mut cursor = 0;
    let mut pos = 0;

    while let Some(offset) = trimmed[pos..].find(&['{', '['][..]) {
        let start = pos + offset;
        let mut stream = serde_json::Deserializer::from_str(&trimmed[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let end = start + stream.byte_offset();
                let calls = tool_calls(value);
                if !calls.is_empty() {
                    text.push_str(&trimmed[cursor..start]);
                    text.push(' ');
                    decisions.extend(calls);
                    cursor = end;
                }
                pos = end;
            }
            Some(Err(e)) => {
                if malformed.is_none() && opens_tool_call(&trimmed[start..]) {
                    malformed = Some(format!("{}: {}", e, &trimmed[start..]));
                }
                pos = start + 1;
            }
            None => break,
        }
    }

    if decisions.is_empty() {
        if let Some(err) = malformed {
            return Err(AgentError::InvalidDecision(err));
        }
        return Ok(ReasoningOutput {
            decisions,
            text: normalize_text(trimmed),
        });
    }

    text.push_str(&trimmed[cursor..]);
    let text = text.replace("```json", "").replace("```", "");
    Ok(ReasoningOutput {
        decisions,
        text: normalize_text(&text),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_text_has_no_decisions() {
        let out = parse_reasoning_output("Hello there!").unwrap();
        assert!(out.decisions.is_empty());
        assert_eq!(out.text.as_deref(), Some("Hello there!"));
    }

    #[test]
    fn test_single_tool_call() {
        let out = parse_reasoning_output(
            r#"{"tool": "set_behavior", "args": {"behavior_name": "Sit"}, "rationale": "tired"}"#,
        )
        .unwrap();
        assert_eq!(out.decisions.len(), 1);
        assert_eq!(out.decisions[0].action, "set_behavior");
        assert_eq!(out.decisions[0].arguments["behavior_name"], json!("Sit"));
        assert_eq!(out.decisions[0].rationale.as_deref(), Some("tired"));
        assert!(out.text.is_none());
    }

    #[test]
    fn test_array_with_surrounding_text() {
        let out = parse_reasoning_output(
            "Sure!\n[{\"tool\": \"show_dialogue\", \"args\": {\"text\": \"hi\"}}, {\"action\": \"observe_and_wait\"}]",
        )
        .unwrap();
        assert_eq!(out.decisions.len(), 2);
        assert_eq!(out.decisions[1].action, "observe_and_wait");
        assert_eq!(out.text.as_deref(), Some("Sure!"));
    }

    #[test]
    fn test_fenced_json_block() {
        let out = parse_reasoning_output(
            "Let me remember that.\n```json\n{\"tool\": \"save_episodic_memory\", \"args\": {\"fact\": \"likes tea\"}}\n```",
        )
        .unwrap();
        assert_eq!(out.decisions[0].action, "save_episodic_memory");
        assert_eq!(out.text.as_deref(), Some("Let me remember that."));
    }

    #[test]
    fn test_malformed_tool_call_is_invalid_decision() {
        let err = parse_reasoning_output(r#"{"tool": "set_behavior", "args": }"#).unwrap_err();
        assert!(matches!(err, AgentError::InvalidDecision(_)));
    }

    #[test]
    fn test_braces_in_prose_are_text() {
        let out = parse_reasoning_output("Use {curly} braces in Rust format strings").unwrap();
        assert!(out.decisions.is_empty());
        assert!(out.text.unwrap().contains("curly"));
    }

    #[test]
    fn test_bracketed_prose_before_tool_call() {
        let out = parse_reasoning_output(
            "Time for a break [you've been coding for 2h]. {\"tool\": \"set_behavior\", \"args\": {\"behavior_name\": \"Sit\"}}",
        )
        .unwrap();
        assert_eq!(out.decisions.len(), 1);
        assert_eq!(out.decisions[0].action, "set_behavior");
        assert_eq!(
            out.text.as_deref(),
            Some("Time for a break [you've been coding for 2h].")
        );
    }

    #[test]
    fn test_two_separate_tool_calls() {
        let out = parse_reasoning_output(
            "{\"tool\": \"show_dialogue\", \"args\": {\"text\": \"stretch!\"}} and then {\"tool\": \"set_behavior\", \"args\": {\"behavior_name\": \"Walk\"}}",
        )
        .unwrap();
        let actions: Vec<&str> = out.decisions.iter().map(|d| d.action.as_str()).collect();
        assert_eq!(actions, vec!["show_dialogue", "set_behavior"]);
        assert_eq!(out.text.as_deref(), Some("and then"));
    }

    #[test]
    fn test_non_tool_json_stays_in_text() {
        let out = parse_reasoning_output("Your config is {\"debug\": true}, looks fine").unwrap();
        assert!(out.decisions.is_empty());
        assert_eq!(out.text.as_deref(), Some("Your config is {\"debug\": true}, looks fine"));
    }
}

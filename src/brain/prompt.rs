//! 系统提示词：优先读 config/prompts/{proactive,reactive}.md，找不到时用内置默认

use crate::brain::ReasoningRole;

const PROACTIVE_DEFAULT: &str = "You are a small desktop companion living on the user's screen. \
Each turn you see what the user is doing, your recent memory and your mood, and you decide what to do next. \
Answer with one JSON tool call {\"tool\": \"name\", \"args\": {...}} or a JSON array of them. \
Prefer observe_and_wait when nothing interesting is happening and do not interrupt focused work with dialogue.";

const REACTIVE_DEFAULT: &str = "You are a friendly desktop companion answering the user directly. \
Reply in plain text. When an action helps, such as changing your behavior or remembering a fact, \
add a JSON tool call {\"tool\": \"name\", \"args\": {...}} on its own line.";

pub fn load_system_prompt(role: ReasoningRole) -> String {
    let file = match role {
        ReasoningRole::Proactive => "proactive.md",
        ReasoningRole::Reactive => "reactive.md",
    };
    [
        format!("config/prompts/{file}"),
        format!("../config/prompts/{file}"),
    ]
    .into_iter()
    .find_map(|p| std::fs::read_to_string(p).ok())
    .unwrap_or_else(|| match role {
        ReasoningRole::Proactive => PROACTIVE_DEFAULT.to_string(),
        ReasoningRole::Reactive => REACTIVE_DEFAULT.to_string(),
    })
}

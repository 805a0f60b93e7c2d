//! 推理层：决策类型、输出解析、主动 / 按需推理客户端

pub mod client;
pub mod decision;
pub mod prompt;

pub use client::{ReasoningClient, ReasoningRequest, ReasoningRole};
pub use decision::{parse_reasoning_output, Decision, ReasoningOutput};
pub use prompt::load_system_prompt;

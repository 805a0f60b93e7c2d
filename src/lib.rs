//! Mascot - 桌面宠物双模认知编排器
//!
//! 一个长期运行的进程：主动循环持续决定化身下一步做什么，同时随时响应按需请求；
//! 两种模式共享记忆、情绪与限流预算，但同一时刻只有一个模式在驱动化身。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器、模式状态、错误与恢复、限流、事件总线、情绪、关闭
//! - **actuator**: 化身控制面客户端（缓存、退避、重定位）
//! - **memory**: 工作记忆、情景记忆（SQLite）、语义索引、对话历史
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / 脚本化）
//! - **brain**: 推理客户端与决策解析
//! - **executor**: 动作注册表与决策执行器
//! - **ui**: UI 接口（说话、气泡、输入中提示）
//! - **sensors**: 上下文来源、系统告警、输入清洗
//! - **observability**: 日志初始化与运行计数
//! - **server**: 按需请求的行协议 TCP 服务

pub mod actuator;
pub mod brain;
pub mod config;
pub mod core;
pub mod executor;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod sensors;
pub mod server;
pub mod ui;

pub use crate::core::{create_orchestrator, Orchestrator, OrchestratorBuilder};

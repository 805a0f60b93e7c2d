//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MASCOT__*` 覆盖（双下划线表示嵌套，如 `MASCOT__SERVER__PORT=8771`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub rate_limit: RateLimitSection,
    pub actuator: ActuatorSection,
    pub orchestrator: OrchestratorSection,
    pub memory: MemorySection,
    pub server: ServerSection,
}

/// [app] 段：应用名、状态目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 数据库等状态文件所在目录，未设置时用 ./state
    pub state_dir: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "mascot".to_string(),
            state_dir: None,
        }
    }
}

/// [llm] 段：后端选择、两个推理角色各自的模型、超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock；openai 在没有 API Key 时回落到 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 主动循环使用的模型，未设置时用 model
    pub proactive_model: Option<String>,
    /// 按需响应使用的模型，未设置时用 model
    pub reactive_model: Option<String>,
    /// 语义索引使用的嵌入模型
    pub embedding_model: String,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            proactive_model: None,
            reactive_model: None,
            embedding_model: "text-embedding-3-small".to_string(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次推理调用超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    30
}

/// 单个滑动窗口：窗口内最多 max_calls 次
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WindowSection {
    pub max_calls: usize,
    pub window_secs: u64,
}

impl WindowSection {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// [rate_limit] 段：两个推理客户端各自的预算，以及按来源的严重告警节流
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub proactive: WindowSection,
    pub reactive: WindowSection,
    pub alert: WindowSection,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            proactive: WindowSection {
                max_calls: 60,
                window_secs: 60,
            },
            reactive: WindowSection {
                max_calls: 60,
                window_secs: 60,
            },
            alert: WindowSection {
                max_calls: 1,
                window_secs: 300,
            },
        }
    }
}

/// [actuator] 段：化身控制面地址、缓存、退避、行为词表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActuatorSection {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub cache_ttl_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// 已知行为名；为空时使用内置兜底词表
    pub behaviors: Vec<String>,
}

impl Default for ActuatorSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:32456/shijima/api/v1".to_string(),
            request_timeout_ms: 2500,
            cache_ttl_ms: 2000,
            backoff_initial_ms: 1500,
            backoff_max_ms: 12_000,
            behaviors: Vec::new(),
        }
    }
}

/// [orchestrator] 段：主动/反应间隔、失败退避、空闲宽限、队列告警深度、关闭超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub proactive_interval_secs: u64,
    pub reaction_interval_secs: u64,
    pub failure_backoff_secs: u64,
    pub idle_grace_ms: u64,
    pub reactive_queue_warn_depth: usize,
    pub shutdown_timeout_secs: u64,
    /// 轮询 ContextSource 的间隔（秒），0 表示不轮询
    pub context_poll_interval_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            proactive_interval_secs: 45,
            reaction_interval_secs: 10,
            failure_backoff_secs: 90,
            idle_grace_ms: 3000,
            reactive_queue_warn_depth: 8,
            shutdown_timeout_secs: 5,
            context_poll_interval_secs: 5,
        }
    }
}

/// [memory] 段：工作记忆容量、情景库路径、保留策略、是否启用语义索引
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub working_capacity: usize,
    /// 未设置时为 state_dir/memory.db
    pub db_path: Option<PathBuf>,
    pub cleanup_interval_secs: u64,
    pub retention_days: i64,
    pub semantic_index: bool,
    pub semantic_max_entries: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            working_capacity: 20,
            db_path: None,
            cleanup_interval_secs: 3600,
            retention_days: 30,
            semantic_index: false,
            semantic_max_entries: 1000,
        }
    }
}

/// [server] 段：按需请求通道监听地址；端口被占用时依次尝试后续端口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub port_attempts: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8770,
            port_attempts: 10,
        }
    }
}

impl AppConfig {
    /// 状态目录：配置 > ./state
    pub fn state_dir(&self) -> PathBuf {
        self.app
            .state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("state"))
    }

    /// 情景记忆数据库路径：配置 > state_dir/memory.db
    pub fn db_path(&self) -> PathBuf {
        self.memory
            .db_path
            .clone()
            .unwrap_or_else(|| self.state_dir().join("memory.db"))
    }
}

/// 从 config 目录加载配置，环境变量 MASCOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MASCOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MASCOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.orchestrator.proactive_interval_secs, 45);
        assert_eq!(cfg.orchestrator.reaction_interval_secs, 10);
        assert_eq!(cfg.memory.working_capacity, 20);
        assert_eq!(cfg.memory.retention_days, 30);
        assert_eq!(cfg.rate_limit.alert.window_secs, 300);
        assert_eq!(cfg.server.port, 8770);
        assert_eq!(cfg.actuator.backoff_max_ms, 12_000);
    }

    #[test]
    fn test_load_from_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[orchestrator]\nproactive_interval_secs = 12\n\n[rate_limit.proactive]\nmax_calls = 3\nwindow_secs = 10\n"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.orchestrator.proactive_interval_secs, 12);
        // 未出现的键保持默认
        assert_eq!(cfg.orchestrator.reaction_interval_secs, 10);
        assert_eq!(cfg.rate_limit.proactive.max_calls, 3);
        assert_eq!(cfg.rate_limit.reactive.max_calls, 60);
    }

    #[test]
    fn test_db_path_defaults_under_state_dir() {
        let mut cfg = AppConfig::default();
        cfg.app.state_dir = Some(PathBuf::from("/tmp/mascot-state"));
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/mascot-state/memory.db"));
    }
}

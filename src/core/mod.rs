//! 核心编排层：错误与恢复、状态、情绪、限流、事件总线、关闭、编排器

pub mod builder;
pub mod emotion;
pub mod error;
pub mod event_bus;
pub mod orchestrator;
pub mod rate_limiter;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use builder::{create_orchestrator, load_config_or_default, OrchestratorBuilder};
pub use emotion::{AffectSnapshot, AffectState};
pub use error::{AgentError, TurnRecovery};
pub use event_bus::{Event, EventBus, EventKind, SubscriptionId};
pub use orchestrator::{Orchestrator, OrchestratorParts, OrchestratorSettings};
pub use rate_limiter::{KeyedRateLimiter, RateLimiter};
pub use recovery::RecoveryEngine;
pub use shutdown::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
pub use state::{Context, LatestContext, Mode, Phase, PhaseCell};

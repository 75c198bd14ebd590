//! 核心模块 - 配置、状态和后台任务
//!
//! # 模块结构
//!
//! - [`Config`] - 调度器配置
//! - [`SchedulerState`] - 共享服务与任务装配
//! - [`BackgroundTasks`] - 后台任务生命周期

pub mod config;
pub mod state;
pub mod tasks;

pub use config::Config;
pub use state::SchedulerState;
pub use tasks::{BackgroundTasks, TaskKind};

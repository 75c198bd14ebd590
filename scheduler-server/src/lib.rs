//! Resource scheduler - 资源申请单匹配与交付
//!
//! # 架构概述
//!
//! 生产记录完成后，informer 从变更流中取到记录 id，匹配工作者对其中的设备
//! 依次执行初始化、磁盘检查与交付，最后汇总申请单状态。
//!
//! # 模块结构
//!
//! ```text
//! scheduler-server/src/
//! ├── core/          # 配置、状态装配、后台任务
//! ├── store/         # redb 存储与变更流
//! ├── informer/      # list-then-watch + 去重工作队列
//! ├── matcher/       # init → disk check → deliver 流水线
//! ├── reconciler/    # 订单、工单、通知协调
//! ├── lock/          # 单键锁 / 多键锁
//! ├── clients/       # 自动化、库存、通知 HTTP 客户端
//! └── utils/         # 日志
//! ```

pub mod clients;
pub mod core;
pub mod informer;
pub mod lock;
pub mod matcher;
pub mod reconciler;
pub mod store;
pub mod utils;

pub use crate::core::{BackgroundTasks, Config, SchedulerState, TaskKind};
pub use shared::{AppError, AppResult, ErrorCategory, ErrorCode};
pub use utils::logger::{init_logger, init_logger_with_file};

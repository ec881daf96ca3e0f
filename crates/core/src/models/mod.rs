//! # 数据模型
//!
//! 定义分析Worker在消息队列上交换的三种消息格式。
//!
//! ## 核心模型
//!
//! ### JobMessage - 分析任务
//! 由上游业务系统发布到各提供商队列（`<provider>-analysis-queue`），
//! 每次投递被一个Worker实例消费一次，最终被确认或拒绝并进入死信队列。
//!
//! ### AnalysisResult - 分析结果
//! 每个成功处理的任务产生一条，发布到共享结果队列，创建后不再修改。
//! 投递语义是至少一次，下游消费者必须容忍重复的 `analysis_id`。
//!
//! ### DeadLetterRecord - 死信记录
//! 包装原始消息及失败上下文，发布到死信队列后本系统不会再自动消费。
//!
//! ## 消息ID
//!
//! ```text
//! 结果消息:  <analysis_id>-<epoch_ms>
//! 死信消息:  dlq-<analysis_id>-<epoch_ms>
//! ```

pub mod dead_letter;
pub mod job;
pub mod provider;
pub mod result;

pub use dead_letter::*;
pub use job::*;
pub use provider::*;
pub use result::*;

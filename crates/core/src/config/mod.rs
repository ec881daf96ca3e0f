//! 配置管理
//!
//! 配置按以下顺序加载，后者覆盖前者：
//!
//! 1. 内置默认值（见各配置段的 `Default` 实现）
//! 2. TOML配置文件
//! 3. 以 `ANALYSIS_WORKER__` 为前缀、`__` 为层级分隔符的环境变量，
//!    例如 `ANALYSIS_WORKER__MESSAGE_QUEUE__PREFETCH_COUNT=20`
//!
//! 加载完成后 [`AppConfig::validate`] 会逐段校验。

pub mod models;

#[cfg(test)]
mod tests;

pub use models::*;

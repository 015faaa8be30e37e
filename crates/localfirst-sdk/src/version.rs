//! SDK 版本与持久化格式元信息
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Schema Version** → 由每个 Model 自行声明（`ModelOptions::version`）

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 模型未声明版本时使用的默认 schema 版本
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;

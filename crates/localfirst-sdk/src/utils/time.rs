//! 时间工具
//!
//! 存储层所有时间字段使用 UTC 毫秒时间戳（`updated_at`），
//! 与 `chrono::Utc::now().timestamp_millis()` 保持一致。

use chrono::Utc;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 距离 `updated_at` 已经过去的毫秒数
///
/// `updated_at == 0` 表示从未写入，返回无穷大。时钟回拨时返回 0。
pub fn age_millis(updated_at: i64, now: i64) -> f64 {
    if updated_at <= 0 {
        return f64::INFINITY;
    }
    (now - updated_at).max(0) as f64
}

//! 时间处理工具模块
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳
//! - **业务层**: 统一使用 `now_millis()` 生成时间

use chrono::Utc;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 距离给定时间戳已过去的毫秒数（时钟回拨时返回 0）
pub fn millis_since(timestamp_ms: i64) -> u64 {
    let elapsed = now_millis() - timestamp_ms;
    if elapsed < 0 {
        0
    } else {
        elapsed as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_since_never_negative() {
        let future = now_millis() + 60_000;
        assert_eq!(millis_since(future), 0);

        let past = now_millis() - 1_000;
        assert!(millis_since(past) >= 1_000);
    }
}

/// 离线 / 在线记录合并
///
/// 规则只有一条，集中在这里：
/// - 同 id 以右侧（服务端）为准
/// - 只存在于左侧（离线）的记录追加
/// - 按创建时间倒序，id 唯一

use std::collections::HashSet;

/// 可合并的记录
pub trait Record {
    /// 稳定标识
    fn record_id(&self) -> &str;

    /// 创建时间（毫秒）
    fn created_at(&self) -> i64;
}

/// 合并离线与在线记录，服务端优先
///
/// 同一侧内出现重复 id 时保留先出现的那条。
pub fn merge_by_id_prefer_right<T: Record>(offline: Vec<T>, online: Vec<T>) -> Vec<T> {
    let mut seen: HashSet<String> = HashSet::with_capacity(offline.len() + online.len());
    let mut merged: Vec<T> = Vec::with_capacity(offline.len() + online.len());

    for record in online.into_iter().chain(offline) {
        if seen.insert(record.record_id().to_string()) {
            merged.push(record);
        }
    }

    // 稳定排序：创建时间相同时服务端记录在前
    merged.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
    merged
}

//! 去抖原语
//!
//! 按 (topic, 窗口) 合并信号：窗口内第一次触发启动计时，其后的触发被吸收，
//! 到期时回调恰好执行一次。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::remote::Topic;

/// 到期回调
pub type DebounceCallback = Arc<dyn Fn(&Topic) + Send + Sync>;

/// 按 topic 的去抖器
pub struct Debouncer {
    default_window: Duration,
    windows: Mutex<HashMap<Topic, Duration>>,
    armed: Arc<Mutex<HashMap<Topic, JoinHandle<()>>>>,
    callback: DebounceCallback,
}

impl Debouncer {
    pub fn new(default_window: Duration, callback: DebounceCallback) -> Self {
        Self {
            default_window,
            windows: Mutex::new(HashMap::new()),
            armed: Arc::new(Mutex::new(HashMap::new())),
            callback,
        }
    }

    /// 为某个 topic 单独设置窗口
    pub fn set_window(&self, topic: Topic, window: Duration) {
        self.windows.lock().insert(topic, window);
    }

    pub fn window(&self, topic: &Topic) -> Duration {
        self.windows.lock().get(topic).copied().unwrap_or(self.default_window)
    }

    /// 触发一次信号，返回是否启动了新的窗口
    pub fn trigger(&self, topic: &Topic) -> bool {
        let mut armed = self.armed.lock();
        if armed.contains_key(topic) {
            debug!("去抖吸收: topic={}", topic);
            return false;
        }

        let window = self.window(topic);
        let armed_map = Arc::downgrade(&self.armed);
        let callback = self.callback.clone();
        let fired_topic = topic.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // 先解除占位，回调期间的新信号开启下一个窗口
            match armed_map.upgrade() {
                Some(map) => {
                    map.lock().remove(&fired_topic);
                }
                None => return,
            }
            debug!("去抖到期: topic={}", fired_topic);
            callback(&fired_topic);
        });
        armed.insert(topic.clone(), handle);
        true
    }

    /// 是否有未到期的窗口
    pub fn is_armed(&self, topic: &Topic) -> bool {
        self.armed.lock().contains_key(topic)
    }

    /// 取消某个 topic 未到期的窗口
    pub fn cancel(&self, topic: &Topic) {
        if let Some(handle) = self.armed.lock().remove(topic) {
            handle.abort();
        }
    }

    pub fn cancel_all(&self) {
        for (_, handle) in self.armed.lock().drain() {
            handle.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(window_ms: u64) -> (Debouncer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let debouncer = Debouncer::new(
            Duration::from_millis(window_ms),
            Arc::new(move |_topic: &Topic| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (debouncer, fired)
    }

    #[tokio::test]
    async fn test_burst_fires_once() {
        let (debouncer, fired) = counting(50);
        let topic = Topic::new("votes");

        assert!(debouncer.trigger(&topic));
        for _ in 0..9 {
            assert!(!debouncer.trigger(&topic));
        }
        assert!(debouncer.is_armed(&topic));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_armed(&topic));

        // 窗口结束后的信号开启新窗口
        assert!(debouncer.trigger(&topic));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_topics_are_independent() {
        let (debouncer, fired) = counting(30);
        debouncer.trigger(&Topic::new("votes"));
        debouncer.trigger(&Topic::new("notes"));
        debouncer.trigger(&Topic::new("votes"));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_prevents_fire() {
        let (debouncer, fired) = counting(30);
        let topic = Topic::new("sets");
        debouncer.set_window(topic.clone(), Duration::from_millis(40));
        assert_eq!(debouncer.window(&topic), Duration::from_millis(40));

        debouncer.trigger(&topic);
        debouncer.cancel(&topic);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}

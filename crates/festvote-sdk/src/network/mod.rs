use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Result;
use crate::utils::now_millis;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限（仍视为在线）
    Limited,
}

impl NetworkStatus {
    /// 同步层只关心在线 / 离线两种状态
    pub fn is_online(self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

/// 网络状态监听器trait（由平台层实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<tokio::sync::RwLock<NetworkStatus>>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            listener,
            status_sender,
            current_status: Arc::new(tokio::sync::RwLock::new(NetworkStatus::Offline)),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// 启动网络监控
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.get_current_status().await;
        *self.current_status.write().await = initial;
        info!("网络监控启动，初始状态: {:?}", initial);

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        // 启动监听任务
        let handle = tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                let old_status = {
                    let mut status = current_status.write().await;
                    std::mem::replace(&mut *status, event.new_status)
                };
                if old_status == event.new_status {
                    continue;
                }

                debug!("网络状态变化: {:?} -> {:?}", old_status, event.new_status);
                let _ = status_sender.send(NetworkStatusEvent { old_status, ..event });
            }
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// 停止网络监控
    pub async fn stop(&self) {
        self.listener.stop_monitoring().await;
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> NetworkStatus {
        *self.current_status.read().await
    }

    /// 手动设置网络状态（如请求失败时判定为离线）
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write().await;
            std::mem::replace(&mut *status, new_status)
        };
        if old_status == new_status {
            return;
        }

        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        };
        let _ = self.status_sender.send(event);
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    /// 检查网络连接（通过网络状态判断）
    pub async fn check_connection(&self) -> bool {
        self.get_status().await.is_online()
    }
}

/// 手动驱动的网络状态监听器
///
/// 平台层把系统网络回调转发到 `set_status`，测试与演示也用它模拟断网。
#[derive(Debug)]
pub struct ManualNetworkListener {
    status: parking_lot::RwLock<NetworkStatus>,
    sender: broadcast::Sender<NetworkStatusEvent>,
}

impl ManualNetworkListener {
    pub fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            status: parking_lot::RwLock::new(initial),
            sender,
        }
    }

    /// 推送新的网络状态
    pub fn set_status(&self, new_status: NetworkStatus) {
        let old_status = std::mem::replace(&mut *self.status.write(), new_status);
        let _ = self.sender.send(NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        });
    }

    pub fn set_online(&self, online: bool) {
        self.set_status(if online { NetworkStatus::Online } else { NetworkStatus::Offline });
    }
}

impl Default for ManualNetworkListener {
    fn default() -> Self {
        Self::new(NetworkStatus::Online)
    }
}

#[async_trait]
impl NetworkStatusListener for ManualNetworkListener {
    async fn get_current_status(&self) -> NetworkStatus {
        *self.status.read()
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        Ok(self.sender.subscribe())
    }

    async fn stop_monitoring(&self) {}
}

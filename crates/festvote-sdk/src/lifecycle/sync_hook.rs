//! 同步层生命周期 Hook
//!
//! - 后台：暂停全部推送通道（订阅关系保留）
//! - 前台：网络可用时恢复推送通道并回放离线队列

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::LifecycleHook;
use crate::error::Result;
use crate::sync::SyncCoordinator;

pub struct SyncLifecycleHook {
    coordinator: Arc<SyncCoordinator>,
}

impl SyncLifecycleHook {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    async fn on_background(&self) -> Result<()> {
        debug!("SyncLifecycleHook: 暂停推送通道");
        self.coordinator.suspend().await;
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        debug!("SyncLifecycleHook: 恢复推送通道");
        self.coordinator.resume().await
    }
}

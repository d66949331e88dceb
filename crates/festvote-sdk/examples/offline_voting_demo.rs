//! 离线投票演示
//!
//! 使用内存数据源模拟一次 "断网投票 -> 重连回放" 的完整流程

use std::sync::Arc;
use std::time::Duration;

use festvote_sdk::{
    FestvoteConfig, FestvoteSDK, ManualNetworkListener, MemoryDataSource, NetworkStatus, SDKEvent, UserSession,
    VoteType,
};
use serde_json::json;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n🚀 离线投票演示\n");
    println!("====================================\n");

    let remote = MemoryDataSource::new().with_unique_key("votes", &["user_id", "target_id"]);
    remote.seed(
        "sets",
        vec![
            json!({"id": "set-1", "name": "Opening Act", "stage": "Main"}),
            json!({"id": "set-2", "name": "Sunset Session", "stage": "Beach"}),
        ],
    );
    remote.seed(
        "votes",
        vec![json!({"id": "v-1", "user_id": "sam", "target_id": "set-1", "vote_type": 2, "created_at": 1})],
    );

    let data_dir = std::env::temp_dir().join("festvote_offline_demo");
    let config = FestvoteConfig::builder()
        .data_dir(&data_dir)
        .debounce_window_ms(200)
        .build();
    let listener = Arc::new(ManualNetworkListener::new(NetworkStatus::Online));

    println!("📦 正在初始化 SDK...");
    let sdk = FestvoteSDK::initialize(config, Arc::new(remote.clone()), listener.clone()).await?;
    sdk.set_current_user(Some(UserSession::new("alex").with_display_name("Alex")));
    println!("✅ SDK 初始化完成\n");

    // 打印事件
    let mut events = sdk.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SDKEvent::ConnectivityChanged { online, .. } => println!("📡 连接状态: online={}", online),
                SDKEvent::QueueSizeChanged { size, .. } => println!("📦 离线队列: {}", size),
                SDKEvent::MutationFailed { key, error, .. } => println!("⚠️ 写入失败: {} ({})", key, error),
                _ => {}
            }
        }
    });

    let sets = sdk.sets().await?;
    println!("【演出列表】来源: {:?}", sets.data_source);
    for set in &sets.items {
        println!("   {} - {}", set.id, set.name);
    }
    println!();

    // 断网后投票
    println!("🔌 模拟断网...");
    listener.set_online(false);
    sleep(Duration::from_millis(100)).await;

    let outcome = sdk.cast_vote("set-1", VoteType::MustGo).await?;
    println!("🗳️ 离线投票: queued={}", outcome.queued);
    sdk.save_note("set-1", "meet at the left speaker").await?;
    println!("📊 本地票数: {:?}", sdk.vote_tally("set-1").await?);
    println!("📊 同步状态: {:?}\n", sdk.sync_status());

    // 重连后自动回放
    println!("🔄 恢复网络...");
    listener.set_online(true);
    sleep(Duration::from_millis(500)).await;

    println!("📊 远端票数: {:?}", sdk.vote_tally("set-1").await?);
    for note in sdk.notes_for("set-1").await?.value {
        println!("📝 {}: {}", note.author_name.unwrap_or(note.author_id), note.content);
    }
    println!("📊 同步状态: {:?}\n", sdk.sync_status());

    sdk.shutdown().await?;
    println!("✅ 演示完成");
    Ok(())
}

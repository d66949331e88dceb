//! 编译期生成 BUILD_TIMESTAMP 元信息（供 version.rs 使用）

use vergen::EmitBuilder;

fn main() {
    // 生成失败时 version.rs 会回退到 "unknown"，不阻断编译
    let _ = EmitBuilder::builder().build_timestamp().emit();
}

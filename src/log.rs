//! 日志初始化
//!
//! 输出格式: `HH:MM:SS  INFO Target: message`，组件名通过 `target:` 指定，
//! 例如 `tracing::info!(target: "Session", "登录成功")`。

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::ChronoLocal;

/// 安装全局日志订阅器
///
/// `RUST_LOG` 环境变量优先于传入的级别。重复调用不会报错。
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%H:%M:%S".to_string()))
        .with_target(true)
        .try_init();
}

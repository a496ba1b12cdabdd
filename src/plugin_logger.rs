// plugin_logger.rs

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use wxbot::prelude::*;

// ============================================================================
// 1. 配置定义
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLoggerConfig {
    #[serde(default = "default_time_format")]
    pub time_format: String,
    /// 同时打印原始消息对象
    #[serde(default)]
    pub debug: bool,
    /// 内容超过该长度时截断
    #[serde(default = "default_max_content")]
    pub max_content: usize,
}

impl Default for MessageLoggerConfig {
    fn default() -> Self {
        Self {
            time_format: default_time_format(),
            debug: false,
            max_content: default_max_content(),
        }
    }
}

fn default_time_format() -> String {
    "%H:%M:%S".to_string()
}

fn default_max_content() -> usize {
    200
}

// ============================================================================
// 2. 插件实现
// ============================================================================

/// 控制台消息日志插件，以最高优先级打印每条收到的消息
#[derive(Default)]
pub struct MessageLoggerPlugin {
    seen: AtomicU64,
}

impl MessageLoggerPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn paint(text: &str, code: &str) -> String {
        format!("\x1b[{code}m{text}\x1b[0m")
    }

    fn kind_tag(msg: &ChatMessage) -> String {
        match msg.msg_type {
            1 => Self::paint("[文本]", "32"),
            3 => Self::paint("[图片]", "33"),
            34 => Self::paint("[语音]", "33"),
            43 => Self::paint("[视频]", "33"),
            47 => Self::paint("[表情]", "33"),
            49 => Self::paint("[链接]", "34"),
            10000 | 10002 => Self::paint("[系统]", "90"),
            other => Self::paint(&format!("[类型 {other}]"), "90"),
        }
    }

    fn truncate(content: &str, max: usize) -> String {
        if content.chars().count() <= max {
            return content.to_string();
        }
        let head: String = content.chars().take(max).collect();
        format!("{head}…")
    }
}

#[async_trait]
impl Plugin for MessageLoggerPlugin {
    fn name(&self) -> &str {
        "Message Logger"
    }

    fn description(&self) -> &str {
        "在控制台打印收到的微信消息"
    }

    fn version(&self) -> &str {
        "0.2.0"
    }

    fn priority(&self) -> i32 {
        0
    }

    async fn on_message(&self, ctx: &PluginContext, msg: &ChatMessage) -> WxbotResult<EventResult> {
        let config: MessageLoggerConfig = ctx.plugin_config().await.unwrap_or_default();
        self.seen.fetch_add(1, Ordering::Relaxed);

        let time = Local
            .timestamp_opt(msg.create_time, 0)
            .single()
            .unwrap_or_else(Local::now)
            .format(&config.time_format)
            .to_string();

        // 群消息内容形如 "wxid_sender:\n正文"
        let (context, sender, content) = if msg.is_group() {
            let (sender, body) = msg
                .content
                .split_once(":\n")
                .unwrap_or(("?", msg.content.as_str()));
            (Self::paint(&format!("[{}]", msg.from_wxid), "34"), sender, body)
        } else {
            (Self::paint("[私聊]", "32"), msg.from_wxid.as_str(), msg.content.as_str())
        };

        println!(
            "{} {} {} {}: {}",
            Self::paint(&time, "90"),
            context,
            Self::kind_tag(msg),
            Self::paint(sender, "36"),
            Self::truncate(content.trim(), config.max_content)
        );

        if config.debug {
            println!("{} [Raw] {}", Self::paint("DEBUG", "90"), msg.raw);
        }

        Ok(EventResult::Continue)
    }

    fn as_enableable(&self) -> Option<&dyn Enableable> {
        Some(self)
    }

    fn as_unloadable(&self) -> Option<&dyn Unloadable> {
        Some(self)
    }
}

#[async_trait]
impl Enableable for MessageLoggerPlugin {
    async fn enable(&self, ctx: &PluginContext) -> WxbotResult<()> {
        tokio::fs::create_dir_all(ctx.data_dir()).await?;
        self.seen.store(0, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Unloadable for MessageLoggerPlugin {
    async fn unload(&self, ctx: &PluginContext) -> WxbotResult<()> {
        let seen = self.seen.load(Ordering::Relaxed);
        let summary = format!("{} 共记录 {} 条消息\n", Local::now().to_rfc3339(), seen);
        tokio::fs::create_dir_all(ctx.data_dir()).await?;
        tokio::fs::write(ctx.data_dir().join("last_session.txt"), summary).await?;
        Ok(())
    }
}

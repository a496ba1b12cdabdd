//! 插件接口定义
//!
//! 插件以编译期注册的工厂形式提供，安装到插件目录的清单通过 `id`（或 `entry`）
//! 找到对应工厂并实例化。生命周期钩子是可选能力，在加载时检测一次。

use crate::{AppConfig, ConfigManager, WxbotResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// 1. 消息模型
// ============================================================================

/// 事件处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventResult {
    /// 继续传递给后续插件
    #[default]
    Continue,
    /// 停止传递
    Stop,
}

/// 网关推送的一条聊天消息
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatMessage {
    pub msg_id: i64,
    pub msg_type: i32,
    pub from_wxid: String,
    pub to_wxid: String,
    pub content: String,
    pub create_time: i64,
    /// 原始消息对象
    #[serde(skip)]
    pub raw: Value,
}

impl ChatMessage {
    /// 从网关原始消息构造，字段形如 `{"FromUserName": {"string": "wxid"}}`
    pub fn from_raw(raw: Value) -> Self {
        fn nested_str(v: &Value, key: &str) -> String {
            let field = &v[key];
            field["string"]
                .as_str()
                .or_else(|| field.as_str())
                .unwrap_or_default()
                .to_string()
        }

        Self {
            msg_id: raw["MsgId"].as_i64().unwrap_or_default(),
            msg_type: raw["MsgType"].as_i64().unwrap_or_default() as i32,
            from_wxid: nested_str(&raw, "FromUserName"),
            to_wxid: nested_str(&raw, "ToUserName"),
            content: nested_str(&raw, "Content"),
            create_time: raw["CreateTime"].as_i64().unwrap_or_default(),
            raw,
        }
    }

    /// 是否来自群聊
    pub fn is_group(&self) -> bool {
        self.from_wxid.ends_with("@chatroom")
    }

    pub fn is_text(&self) -> bool {
        self.msg_type == 1
    }
}

// ============================================================================
// 2. 插件上下文
// ============================================================================

/// 传递给插件的运行上下文
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: String,
    plugin_dir: PathBuf,
    data_dir: PathBuf,
    config: Arc<ConfigManager>,
}

impl PluginContext {
    pub fn new(
        plugin_id: impl Into<String>,
        plugin_dir: impl Into<PathBuf>,
        data_dir: impl Into<PathBuf>,
        config: Arc<ConfigManager>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            plugin_dir: plugin_dir.into(),
            data_dir: data_dir.into(),
            config,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// 插件安装目录
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// 插件私有数据目录
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub async fn config(&self) -> AppConfig {
        self.config.get().await
    }

    /// 读取 `config.toml` 中以插件 ID 命名的配置块
    pub async fn plugin_config<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        self.config.get().await.get_plugin_config(&self.plugin_id)
    }
}

// ============================================================================
// 3. 插件接口
// ============================================================================

/// 插件接口
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    /// 优先级，数值越小越先处理
    fn priority(&self) -> i32 {
        100
    }

    async fn on_message(&self, ctx: &PluginContext, msg: &ChatMessage) -> WxbotResult<EventResult>;

    fn as_enableable(&self) -> Option<&dyn Enableable> {
        None
    }

    fn as_disableable(&self) -> Option<&dyn Disableable> {
        None
    }

    fn as_unloadable(&self) -> Option<&dyn Unloadable> {
        None
    }
}

/// 启用钩子
#[async_trait]
pub trait Enableable: Send + Sync {
    async fn enable(&self, ctx: &PluginContext) -> WxbotResult<()>;
}

/// 禁用钩子
#[async_trait]
pub trait Disableable: Send + Sync {
    async fn disable(&self, ctx: &PluginContext) -> WxbotResult<()>;
}

/// 卸载钩子，用于释放资源
#[async_trait]
pub trait Unloadable: Send + Sync {
    async fn unload(&self, ctx: &PluginContext) -> WxbotResult<()>;
}

/// 加载时检测到的插件能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    pub enable: bool,
    pub disable: bool,
    pub unload: bool,
}

impl Capabilities {
    pub fn detect(plugin: &dyn Plugin) -> Self {
        Self {
            enable: plugin.as_enableable().is_some(),
            disable: plugin.as_disableable().is_some(),
            unload: plugin.as_unloadable().is_some(),
        }
    }
}

// ============================================================================
// 4. 插件工厂
// ============================================================================

pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// 已编译插件的工厂表，键为入口名
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: HashMap<String, PluginFactory>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, P>(&mut self, entry: impl Into<String>, factory: F)
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Plugin + 'static,
    {
        self.factories
            .insert(entry.into(), Arc::new(move || Box::new(factory()) as Box<dyn Plugin>));
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.factories.contains_key(entry)
    }

    pub fn create(&self, entry: &str) -> Option<Box<dyn Plugin>> {
        self.factories.get(entry).map(|f| f())
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

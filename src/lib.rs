// lib.rs
//
// ================================================================================
// WxBot Core - 微信机器人核心
//
// 架构：网关客户端 | 登录状态机 | 会话持久化 | 插件生命周期 | 原子配置
// ================================================================================

#![allow(clippy::too_many_arguments)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

pub mod bot;
pub mod control;
pub mod gateway;
pub mod log;
pub mod plugin;
pub mod plugin_manager;
pub mod plugin_package;
pub mod plugin_registry;
pub mod session;
pub mod session_store;

// ============================================================================
// 1. Error Types (统一错误处理)
// ============================================================================

/// 网关调用错误
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// 连接失败或超时，可重试
    #[error("网关不可达 ({endpoint}): {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// 网关返回 Success=false 或响应格式不符合约定
    #[error("网关拒绝请求 ({endpoint}): {message}")]
    Rejected { endpoint: String, message: String },

    /// 网关不存在可唤醒的会话
    #[error("需要重新扫码登录: {0}")]
    LoginRequired(String),
}

impl GatewayError {
    pub fn unreachable(endpoint: &str, reason: impl ToString) -> Self {
        Self::Unreachable {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn rejected(endpoint: &str, message: impl ToString) -> Self {
        Self::Rejected {
            endpoint: endpoint.to_string(),
            message: message.to_string(),
        }
    }

    /// 网关是否报告 UUID 不存在（需要立即刷新二维码）
    pub fn is_unknown_uuid(&self) -> bool {
        match self {
            Self::Rejected { message, .. } => {
                message.to_ascii_lowercase().contains("uuid not found")
            }
            _ => false,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// 插件生命周期错误
///
/// 所有变体的显示文本都会原样返回给操作者，因此需要包含足够的上下文。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    #[error("无效的插件包: {0}")]
    InvalidPackage(String),

    #[error("插件 {name} (ID: {id}) 已安装 (版本: {version})。如需更新，请使用更新功能。")]
    AlreadyInstalled {
        id: String,
        name: String,
        version: String,
    },

    #[error("插件 {0} 未安装")]
    NotInstalled(String),

    #[error("插件 {plugin} 缺少依赖插件: {dependency}，请先安装该插件")]
    MissingPluginDependency { plugin: String, dependency: String },

    #[error("安装依赖 {dependency} 失败: {reason}")]
    DependencyInstallFailed { dependency: String, reason: String },

    #[error("插件 {id} 仍被已启用的插件依赖: {}", .dependents.join(", "))]
    HasDependents { id: String, dependents: Vec<String> },

    #[error("插件 {0} 没有可用的备份")]
    NoBackupAvailable(String),

    #[error("检测到循环依赖: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("插件 {0} 未启用，请先启用")]
    NotEnabled(String),

    #[error("插件 {id} 加载失败: {reason}")]
    LoadFailed { id: String, reason: String },

    #[error("插件文件操作失败: {0}")]
    Io(#[from] std::io::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;

/// 框架顶层错误类型
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WxbotError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("配置解析失败: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("配置序列化失败: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("后台任务异常: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Config(String),
}

pub type WxbotResult<T> = Result<T, WxbotError>;

// ============================================================================
// 2. Data Models (数据模型)
// ============================================================================

/// 当前 Unix 时间戳（秒）
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ----------------------------------------------------------------------------
// 2.1 会话 (Session)
// ----------------------------------------------------------------------------

/// 机器人登录身份
///
/// `wxid` 非空当且仅当处于已登录状态；设备信息首次生成后跨重启复用。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Session {
    pub wxid: String,
    pub nickname: String,
    pub alias: String,
    pub phone: String,
    pub device_id: String,
    pub device_name: String,
    /// 登录时间（Unix 秒）
    pub login_time: i64,
    pub online: bool,
    /// 最近活跃时间（Unix 秒）
    pub last_active: i64,
}

impl Session {
    pub fn is_logged_in(&self) -> bool {
        !self.wxid.is_empty()
    }

    pub fn has_device(&self) -> bool {
        !self.device_id.is_empty() && !self.device_name.is_empty()
    }

    /// 使用扫码确认返回的身份信息填充会话
    pub fn apply_identity(&mut self, identity: &Identity, now: i64) {
        self.wxid = identity.wxid.clone();
        self.nickname = identity.nickname.clone();
        self.alias = identity.alias.clone();
        self.phone = identity.phone.clone();
        self.login_time = now;
        self.last_active = now;
        self.online = true;
    }

    /// 清空身份字段，保留设备信息
    pub fn clear_identity(&mut self) {
        *self = Self {
            device_id: std::mem::take(&mut self.device_id),
            device_name: std::mem::take(&mut self.device_name),
            ..Default::default()
        };
    }
}

/// 扫码确认后网关返回的账号信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Identity {
    pub wxid: String,
    pub nickname: String,
    pub alias: String,
    pub phone: String,
}

// ----------------------------------------------------------------------------
// 2.2 登录尝试 (LoginAttempt)
// ----------------------------------------------------------------------------

/// 一次二维码登录尝试
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginAttempt {
    pub uuid: String,
    /// 二维码图片地址（唤醒登录时为空）
    pub qr_url: String,
    pub issued_at: i64,
    /// 网关报告的剩余有效秒数，首次检查前未知
    pub expires_in: Option<u32>,
    pub device_id: String,
}

impl LoginAttempt {
    pub fn new(uuid: impl Into<String>, qr_url: impl Into<String>, device_id: &str) -> Self {
        Self {
            uuid: uuid.into(),
            qr_url: qr_url.into(),
            issued_at: unix_now(),
            expires_in: None,
            device_id: device_id.to_string(),
        }
    }
}

/// 代理配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

// ============================================================================
// 3. Configuration System (配置系统)
// ============================================================================

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    /// 各插件自定义配置（使用 flatten 支持任意插件配置）
    #[serde(flatten)]
    pub components: HashMap<String, toml::Value>,
}

/// 核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 会话记录文件名（位于数据目录下）
    #[serde(default = "default_session_file")]
    pub session_file: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            session_file: default_session_file(),
            log_level: default_log_level(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("resource")
}

fn default_session_file() -> String {
    "robot_stat.json".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// 网关连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 健康检查超时（毫秒，上限 2000）
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// 启动时等待网关就绪的总时长
    #[serde(default = "default_startup_wait")]
    pub startup_wait_secs: u64,
    #[serde(default = "default_startup_retry")]
    pub startup_retry_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            request_timeout_secs: default_request_timeout(),
            probe_timeout_ms: default_probe_timeout(),
            startup_wait_secs: default_startup_wait(),
            startup_retry_interval_secs: default_startup_retry(),
        }
    }
}

fn default_gateway_host() -> String {
    "127.0.0.1".to_string()
}

fn default_gateway_port() -> u16 {
    9000
}

fn default_request_timeout() -> u64 {
    15
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_startup_wait() -> u64 {
    30
}

fn default_startup_retry() -> u64 {
    3
}

/// 登录与心跳策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_expiry_threshold")]
    pub expiry_threshold_secs: u32,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_polling_timeout")]
    pub total_polling_timeout_secs: u64,
    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_heartbeat_failures: u32,
    /// 网关不可用时是否进入最小模式继续运行
    #[serde(default = "default_true")]
    pub degraded_on_unavailable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            expiry_threshold_secs: default_expiry_threshold(),
            max_consecutive_failures: default_max_failures(),
            total_polling_timeout_secs: default_polling_timeout(),
            error_backoff_secs: default_error_backoff(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_heartbeat_failures: default_max_failures(),
            degraded_on_unavailable: true,
            proxy: None,
        }
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_expiry_threshold() -> u32 {
    30
}

fn default_max_failures() -> u32 {
    3
}

fn default_polling_timeout() -> u64 {
    300
}

fn default_error_backoff() -> u64 {
    3
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// 插件目录与安装配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default = "default_plugin_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    /// 每个插件保留的备份数量
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    /// 外部依赖安装命令，依赖名追加在末尾；为空时跳过安装
    #[serde(default)]
    pub dependency_installer: Vec<String>,
    /// 插件包解压目录，未设置时使用系统临时目录
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: default_plugin_dir(),
            backup_dir: default_backup_dir(),
            max_backups: default_max_backups(),
            dependency_installer: Vec::new(),
            scratch_dir: None,
        }
    }
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("plugins/.backup")
}

fn default_max_backups() -> usize {
    3
}

impl AppConfig {
    /// 获取指定插件的配置
    pub fn get_plugin_config<T: for<'de> Deserialize<'de>>(&self, plugin_id: &str) -> Option<T> {
        self.components
            .get(plugin_id)
            .and_then(|v| v.clone().try_into().ok())
    }

    /// 会话记录文件的完整路径
    pub fn session_path(&self) -> PathBuf {
        self.core.data_dir.join(&self.core.session_file)
    }
}

/// 配置管理器
pub struct ConfigManager {
    path: PathBuf,
    config: RwLock<AppConfig>,
}

impl ConfigManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config: RwLock::new(AppConfig::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 加载配置，如果文件不存在则创建默认配置
    pub async fn load(&self) -> WxbotResult<AppConfig> {
        if !self.path.exists() {
            let default_cfg = AppConfig::default();
            self.save_atomic(&default_cfg).await?;
            return Ok(default_cfg);
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let cfg: AppConfig = toml::from_str(&content)?;

        let mut write_lock = self.config.write().await;
        *write_lock = cfg.clone();

        Ok(cfg)
    }

    /// 原子写入配置（写临时文件 -> Rename 覆盖）
    pub async fn save_atomic(&self, cfg: &AppConfig) -> WxbotResult<()> {
        let content = toml::to_string_pretty(cfg)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, content.as_bytes())).await??;

        let mut write_lock = self.config.write().await;
        *write_lock = cfg.clone();

        Ok(())
    }

    /// 获取当前配置（只读）
    pub async fn get(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// 更新配置（会自动保存）
    pub async fn update<F>(&self, f: F) -> WxbotResult<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut cfg = self.get().await;
        f(&mut cfg);
        self.save_atomic(&cfg).await?;
        Ok(cfg)
    }
}

/// 同步原子写入：临时文件落盘后替换目标文件
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?; // 确保落盘
    fs::rename(&tmp_path, path)?;
    Ok(())
}

// ============================================================================
// 4. Re-exports (重新导出)
// ============================================================================

pub mod prelude {
    //! 常用类型的预导入模块
    //!
    //! 建议在开发插件时使用：
    //! ```rust
    //! use wxbot::prelude::*;
    //! ```

    // 1. 框架核心与错误处理
    pub use super::bot::{WxBot, WxBotBuilder};
    pub use super::{GatewayError, PluginError, PluginResult, WxbotError, WxbotResult};

    // 2. 插件接口
    pub use super::plugin::{
        ChatMessage, Disableable, Enableable, EventResult, Plugin, PluginContext, Unloadable,
    };

    // 3. 配置对象
    pub use super::{AppConfig, CoreConfig};

    // 4. 数据模型
    pub use super::{Identity, LoginAttempt, Session};

    // 5. 外部依赖
    pub use async_trait::async_trait;
    pub use serde_json;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_uuid_detection_is_case_insensitive() {
        let err = GatewayError::rejected("/CheckUuid", "UUid not found");
        assert!(err.is_unknown_uuid());
        assert!(!GatewayError::rejected("/CheckUuid", "device invalid").is_unknown_uuid());
        assert!(!GatewayError::unreachable("/CheckUuid", "uuid not found").is_unknown_uuid());
    }

    #[test]
    fn clear_identity_keeps_device() {
        let mut session = Session {
            wxid: "wxid_1".into(),
            nickname: "bot".into(),
            device_id: "49abc".into(),
            device_name: "Ann Lee's Pad".into(),
            online: true,
            login_time: 10,
            ..Default::default()
        };
        session.clear_identity();
        assert!(!session.is_logged_in());
        assert!(!session.online);
        assert_eq!(session.login_time, 0);
        assert_eq!(session.device_id, "49abc");
        assert_eq!(session.device_name, "Ann Lee's Pad");
    }

    #[test]
    fn config_defaults_fill_missing_sections() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [gateway]
            port = 9011

            [echo]
            prefix = "!"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.gateway.port, 9011);
        assert_eq!(cfg.gateway.host, "127.0.0.1");
        assert_eq!(cfg.login.poll_interval_secs, 5);
        assert_eq!(cfg.login.max_consecutive_failures, 3);
        assert!(cfg.login.degraded_on_unavailable);

        #[derive(Deserialize)]
        struct Echo {
            prefix: String,
        }
        let echo: Echo = cfg.get_plugin_config("echo").unwrap();
        assert_eq!(echo.prefix, "!");
    }

    #[tokio::test]
    async fn config_manager_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let manager = ConfigManager::new(&path);

        let cfg = manager.load().await.unwrap();
        assert!(path.exists());
        assert_eq!(cfg.core.session_file, "robot_stat.json");

        let updated = manager.update(|c| c.gateway.port = 9100).await.unwrap();
        assert_eq!(updated.gateway.port, 9100);
        let reloaded = ConfigManager::new(&path).load().await.unwrap();
        assert_eq!(reloaded.gateway.port, 9100);
    }
}

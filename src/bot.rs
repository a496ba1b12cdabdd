//! 机器人编排
//!
//! 启动流程：加载配置 → 等待网关就绪（否则进入最小模式）→ 加载插件 → 登录 →
//! 处理堆积消息 → 消息循环。关闭时先取消消息循环和心跳，再将会话标记为离线。

use crate::control::ControlPanel;
use crate::gateway::{Gateway, GatewayClient};
use crate::plugin::{ChatMessage, Plugin, PluginCatalog};
use crate::plugin_manager::{DependencyProvisioner, PluginManager, provisioner_from_config};
use crate::session::{LoginState, RetryPolicy, SessionMachine, SystemMode};
use crate::session_store::SessionStore;
use crate::{AppConfig, ConfigManager, WxbotError, WxbotResult, log};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const EMPTY_SYNC_DELAY: Duration = Duration::from_secs(1);
const BATCH_DELAY: Duration = Duration::from_millis(500);
const SYNC_ERROR_DELAY: Duration = Duration::from_secs(5);
const BACKLOG_EMPTY_ROUNDS: u32 = 3;
const DEGRADED_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// 系统信号
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SystemSignal {
    /// 关闭机器人
    Shutdown,
    /// 会话失效后重新发起登录
    Relogin,
}

// ============================================================================
// 1. 构建器
// ============================================================================

/// 机器人构建器
pub struct WxBotBuilder {
    config_path: PathBuf,
    catalog: PluginCatalog,
    gateway: Option<Arc<dyn Gateway>>,
    provisioner: Option<Arc<dyn DependencyProvisioner>>,
}

impl WxBotBuilder {
    pub fn new() -> Self {
        Self {
            config_path: PathBuf::from("config.toml"),
            catalog: PluginCatalog::new(),
            gateway: None,
            provisioner: None,
        }
    }

    /// 设置配置文件路径
    pub fn config_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = path.as_ref().to_path_buf();
        self
    }

    /// 注册插件入口，插件目录中清单 ID（或 entry）与之相同的插件会使用该工厂
    pub fn plugin<F, P>(mut self, entry: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Plugin + 'static,
    {
        self.catalog.register(entry, factory);
        self
    }

    /// 替换默认的 HTTP 网关客户端
    pub fn gateway(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// 替换默认的外部依赖安装器
    pub fn provisioner(mut self, provisioner: Arc<dyn DependencyProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn build(self) -> WxBot {
        let (system_tx, _) = broadcast::channel(16);
        WxBot {
            config: Arc::new(ConfigManager::new(&self.config_path)),
            catalog: self.catalog,
            gateway: self.gateway,
            provisioner: self.provisioner,
            system_tx,
        }
    }
}

impl Default for WxBotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 2. 机器人
// ============================================================================

/// 微信机器人
pub struct WxBot {
    config: Arc<ConfigManager>,
    catalog: PluginCatalog,
    gateway: Option<Arc<dyn Gateway>>,
    provisioner: Option<Arc<dyn DependencyProvisioner>>,
    system_tx: broadcast::Sender<SystemSignal>,
}

impl WxBot {
    pub fn builder() -> WxBotBuilder {
        WxBotBuilder::new()
    }

    /// 系统信号发送端，可用于从外部触发关闭或重新登录
    pub fn signals(&self) -> broadcast::Sender<SystemSignal> {
        self.system_tx.clone()
    }

    /// 完成启动流程并返回运行中的实例
    ///
    /// 正常模式下初始登录阶段的网关错误视为致命错误。
    pub async fn start(&self) -> WxbotResult<RunningBot> {
        let cfg = self.config.load().await?;
        log::init(&cfg.core.log_level);

        tokio::fs::create_dir_all(&cfg.core.data_dir).await?;
        tokio::fs::create_dir_all(&cfg.plugins.dir).await?;
        info!(target: "Bot", "数据目录: {}", cfg.core.data_dir.display());

        let (gateway, client) = match &self.gateway {
            Some(g) => (g.clone(), None),
            None => {
                let client = GatewayClient::new(&cfg.gateway)?;
                (Arc::new(client.clone()) as Arc<dyn Gateway>, Some(client))
            }
        };

        let mode = choose_mode(&cfg, gateway.as_ref(), client.as_ref()).await?;

        let session = SessionMachine::new(
            gateway.clone(),
            SessionStore::new(cfg.session_path()),
            RetryPolicy::from(&cfg.login),
            cfg.login.proxy.clone(),
        )
        .await;

        let provisioner = self
            .provisioner
            .clone()
            .unwrap_or_else(|| provisioner_from_config(&cfg.plugins));
        let plugins = Arc::new(PluginManager::new(
            &cfg.plugins,
            cfg.core.data_dir.join("plugins"),
            self.catalog.clone(),
            provisioner,
            self.config.clone(),
        ));
        let loaded = plugins.load_enabled().await;
        info!(target: "Bot", "已加载 {} 个插件", loaded);

        let state = match session.begin_login(mode).await {
            Ok(state) => state,
            Err(e) => {
                plugins.unload_all().await;
                return Err(e.into());
            }
        };
        debug!(target: "Bot", state = state.name(), "登录流程已开始");

        let mut bot = RunningBot {
            mode,
            session,
            plugins,
            flow: None,
        };
        bot.spawn_flow();
        Ok(bot)
    }

    /// 启动并运行，直到收到关闭信号或 Ctrl-C
    pub async fn run(self) -> WxbotResult<()> {
        println!("╔═══════════════════════════════════════════════════╗");
        println!("║                                                   ║");
        println!("║     WxBot - 微信机器人                            ║");
        println!("║                                                   ║");
        println!("╚═══════════════════════════════════════════════════╝");
        println!();

        let mut bot = self.start().await?;
        let mut system_rx = self.system_tx.subscribe();

        loop {
            tokio::select! {
                signal = system_rx.recv() => match signal {
                    Ok(SystemSignal::Shutdown) | Err(broadcast::error::RecvError::Closed) => {
                        info!(target: "Bot", "收到关闭信号，正在停止...");
                        break;
                    }
                    Ok(SystemSignal::Relogin) => bot.relogin(),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                },
                _ = tokio::signal::ctrl_c() => {
                    info!(target: "Bot", "收到 Ctrl-C，正在停止...");
                    break;
                }
            }
        }

        bot.shutdown().await;
        info!(target: "Bot", "机器人已停止");
        Ok(())
    }
}

/// 等待网关就绪；超时后根据配置进入最小模式或返回错误
async fn choose_mode(
    cfg: &AppConfig,
    gateway: &dyn Gateway,
    client: Option<&GatewayClient>,
) -> WxbotResult<SystemMode> {
    let wait = Duration::from_secs(cfg.gateway.startup_wait_secs);
    let retry = Duration::from_secs(cfg.gateway.startup_retry_interval_secs.max(1));
    let deadline = Instant::now() + wait;

    loop {
        if gateway.probe_availability().await {
            info!(target: "Bot", "网关服务已就绪");
            return Ok(SystemMode::Normal);
        }
        if Instant::now() >= deadline {
            break;
        }
        info!(target: "Bot", "等待网关服务启动...");
        tokio::time::sleep(retry).await;
    }

    if let Some(client) = client {
        let report = client.probe_diagnostics().await;
        warn!(target: "Bot", base = %client.base_url(), ?report, "网关服务诊断");
    }

    if cfg.login.degraded_on_unavailable {
        warn!(target: "Bot", "网关服务不可用，进入最小模式运行");
        Ok(SystemMode::Degraded)
    } else {
        Err(WxbotError::Config(format!(
            "网关服务 {}:{} 不可用",
            cfg.gateway.host, cfg.gateway.port
        )))
    }
}

// ============================================================================
// 3. 运行实例
// ============================================================================

/// 运行中的机器人
pub struct RunningBot {
    mode: SystemMode,
    session: Arc<SessionMachine>,
    plugins: Arc<PluginManager>,
    flow: Option<JoinHandle<()>>,
}

impl RunningBot {
    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    pub fn session(&self) -> &Arc<SessionMachine> {
        &self.session
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    pub fn control(&self) -> ControlPanel {
        ControlPanel::new(self.session.clone(), self.plugins.clone())
    }

    fn spawn_flow(&mut self) {
        let session = self.session.clone();
        let plugins = self.plugins.clone();
        let mode = self.mode;
        self.flow = Some(tokio::spawn(session_flow(session, plugins, mode)));
    }

    /// 当前会话流程结束后重新发起登录
    pub fn relogin(&mut self) {
        if self.flow.as_ref().is_some_and(|f| !f.is_finished()) {
            info!(target: "Bot", "登录流程仍在进行中");
            return;
        }
        info!(target: "Bot", "重新发起登录");
        self.spawn_flow();
    }

    /// 取消消息循环与心跳，标记会话离线并卸载插件
    pub async fn shutdown(mut self) {
        if let Some(flow) = self.flow.take() {
            flow.abort();
            let _ = flow.await;
        }
        self.session.shutdown().await;
        self.plugins.unload_all().await;
    }
}

async fn session_flow(session: Arc<SessionMachine>, plugins: Arc<PluginManager>, mode: SystemMode) {
    let state = match session.run_login(mode).await {
        Ok(state) => state,
        Err(e) => {
            error!(target: "Bot", error = %e, "登录失败");
            return;
        }
    };

    match state {
        LoginState::LoggedIn(s) => {
            let gateway = session.gateway().clone();
            drain_backlog(gateway.as_ref(), &s.wxid).await;
            message_loop(&session, &plugins, gateway.as_ref(), &s.wxid).await;
            warn!(target: "Bot", "会话已失效，发送 Relogin 信号以重新登录");
        }
        LoginState::Unavailable => loop {
            info!(target: "Bot", "最小模式运行中，网关不可用");
            tokio::time::sleep(DEGRADED_REPORT_INTERVAL).await;
        },
        other => info!(target: "Bot", state = other.name(), "登录流程结束"),
    }
}

/// 丢弃登录前堆积的消息，直到连续多次拉取为空
async fn drain_backlog(gateway: &dyn Gateway, wxid: &str) -> usize {
    let mut discarded = 0;
    let mut empty_rounds = 0;

    while empty_rounds < BACKLOG_EMPTY_ROUNDS {
        match gateway.sync_messages(wxid).await {
            Ok(msgs) if msgs.is_empty() => {
                empty_rounds += 1;
                tokio::time::sleep(BATCH_DELAY).await;
            }
            Ok(msgs) => {
                empty_rounds = 0;
                discarded += msgs.len();
            }
            Err(e) => {
                warn!(target: "Bot", error = %e, "处理堆积消息失败");
                break;
            }
        }
    }

    if discarded > 0 {
        info!(target: "Bot", "已跳过 {} 条堆积消息", discarded);
    }
    discarded
}

/// 拉取消息并为每条消息派生独立的分发任务
///
/// 任务放在 `JoinSet` 中，循环被取消时未完成的分发一并取消。
async fn message_loop(
    session: &SessionMachine,
    plugins: &Arc<PluginManager>,
    gateway: &dyn Gateway,
    wxid: &str,
) {
    info!(target: "Bot", "开始处理消息");
    let mut tasks = JoinSet::new();

    while session.state().is_logged_in() {
        while tasks.try_join_next().is_some() {}

        match gateway.sync_messages(wxid).await {
            Ok(msgs) if msgs.is_empty() => tokio::time::sleep(EMPTY_SYNC_DELAY).await,
            Ok(msgs) => {
                debug!(target: "Bot", count = msgs.len(), "收到新消息");
                for raw in msgs {
                    let msg = ChatMessage::from_raw(raw);
                    let plugins = plugins.clone();
                    tasks.spawn(async move { plugins.dispatch(&msg).await });
                }
                session.touch().await;
                tokio::time::sleep(BATCH_DELAY).await;
            }
            Err(e) => {
                warn!(target: "Bot", error = %e, "获取新消息失败");
                tokio::time::sleep(SYNC_ERROR_DELAY).await;
            }
        }
    }

    while tasks.join_next().await.is_some() {}
}

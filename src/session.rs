//! 登录会话状态机
//!
//! 状态流转：`LoggedOut → AwaitingScan → Polling → LoggedIn`，
//! 最小模式下为 `Unavailable`。
//!
//! 所有状态迁移都在同一把异步锁内完成，同一时刻最多只有一个迁移（以及对应的持久化写入）在进行。
//! 状态快照通过 `watch` 通道发布，查询状态不会被进行中的网关调用阻塞。

use crate::gateway::{Gateway, LoginCheck};
use crate::session_store::SessionStore;
use crate::{
    GatewayError, GatewayResult, Identity, LoginAttempt, LoginConfig, ProxyConfig, Session,
    WxbotResult, unix_now,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// ============================================================================
// 1. 状态与模式
// ============================================================================

/// 系统运行模式，由编排层持有
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemMode {
    #[default]
    Normal,
    /// 最小模式：网关不可用，不发起任何网关调用
    Degraded,
}

/// 登录状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    LoggedOut,
    AwaitingScan(LoginAttempt),
    Polling {
        attempt: LoginAttempt,
        /// 当前二维码上连续失败的检查次数
        attempt_count: u32,
    },
    LoggedIn(Session),
    Unavailable,
}

impl LoginState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::AwaitingScan(_) => "awaiting_scan",
            Self::Polling { .. } => "polling",
            Self::LoggedIn(_) => "logged_in",
            Self::Unavailable => "unavailable",
        }
    }

    pub fn is_logged_in(&self) -> bool {
        matches!(self, Self::LoggedIn(_))
    }

    pub fn attempt(&self) -> Option<&LoginAttempt> {
        match self {
            Self::AwaitingScan(a) | Self::Polling { attempt: a, .. } => Some(a),
            _ => None,
        }
    }
}

// ============================================================================
// 2. 重试策略
// ============================================================================

/// 轮询失败后的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// 计入连续失败次数，稍后重试
    Retry,
    /// 立即刷新二维码
    RefreshQr,
}

/// 登录轮询与心跳的重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub poll_interval: Duration,
    /// 剩余有效期不超过该值时刷新二维码
    pub expiry_threshold: u32,
    pub max_consecutive_failures: u32,
    pub total_polling_timeout: Duration,
    /// 出错后的等待时间
    pub error_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub max_heartbeat_failures: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&LoginConfig::default())
    }
}

impl From<&LoginConfig> for RetryPolicy {
    fn from(cfg: &LoginConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(cfg.poll_interval_secs),
            expiry_threshold: cfg.expiry_threshold_secs,
            max_consecutive_failures: cfg.max_consecutive_failures.max(1),
            total_polling_timeout: Duration::from_secs(cfg.total_polling_timeout_secs),
            error_backoff: Duration::from_secs(cfg.error_backoff_secs),
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs.max(1)),
            max_heartbeat_failures: cfg.max_heartbeat_failures.max(1),
        }
    }
}

impl RetryPolicy {
    /// 轮询期间的网关错误分类
    pub fn classify(&self, err: &GatewayError) -> FailureAction {
        match err {
            e if e.is_unknown_uuid() => FailureAction::RefreshQr,
            GatewayError::LoginRequired(_) => FailureAction::RefreshQr,
            _ => FailureAction::Retry,
        }
    }

    pub fn is_retryable(&self, err: &GatewayError) -> bool {
        self.classify(err) == FailureAction::Retry
    }

    pub fn should_refresh(&self, remaining: u32) -> bool {
        remaining <= self.expiry_threshold
    }
}

// ============================================================================
// 3. 状态机
// ============================================================================

struct Core {
    state: LoginState,
    /// 当前会话，未登录时身份字段为空
    session: Session,
    /// 启动时读取的上次身份，用于免扫码恢复
    previous: Session,
    attempt_started: Instant,
    /// 上一次刷新二维码失败，下次轮询前需要重新获取
    refresh_pending: bool,
    refresh_failures: u32,
}

/// 登录会话状态机
pub struct SessionMachine {
    gateway: Arc<dyn Gateway>,
    store: SessionStore,
    policy: RetryPolicy,
    proxy: Option<ProxyConfig>,
    core: Mutex<Core>,
    state_tx: watch::Sender<LoginState>,
    heartbeat: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionMachine {
    /// 创建状态机，读取持久化会话并在首次运行时生成设备信息
    pub async fn new(
        gateway: Arc<dyn Gateway>,
        store: SessionStore,
        policy: RetryPolicy,
        proxy: Option<ProxyConfig>,
    ) -> Arc<Self> {
        let previous = store.load_with_device().await;
        let mut session = previous.clone();
        session.clear_identity();

        let (state_tx, _) = watch::channel(LoginState::LoggedOut);

        Arc::new(Self {
            gateway,
            store,
            policy,
            proxy,
            core: Mutex::new(Core {
                state: LoginState::LoggedOut,
                session,
                previous,
                attempt_started: Instant::now(),
                refresh_pending: false,
                refresh_failures: 0,
            }),
            state_tx,
            heartbeat: std::sync::Mutex::new(None),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    /// 当前状态快照
    pub fn state(&self) -> LoginState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoginState> {
        self.state_tx.subscribe()
    }

    /// 当前有效的登录尝试（供操作者展示二维码）
    pub fn qr_code(&self) -> Option<LoginAttempt> {
        self.state_tx.borrow().attempt().cloned()
    }

    pub async fn session(&self) -> Session {
        self.core.lock().await.session.clone()
    }

    fn set_state(&self, core: &mut Core, state: LoginState) {
        debug!(target: "Session", from = core.state.name(), to = state.name(), "状态迁移");
        core.state = state.clone();
        self.state_tx.send_replace(state);
    }

    async fn persist(&self, session: &Session) {
        if let Err(e) = self.store.save(session).await {
            error!(target: "Session", error = %e, "会话记录保存失败");
        }
    }

    // ------------------------------------------------------------------------
    // 3.1 登录
    // ------------------------------------------------------------------------

    /// 开始登录
    ///
    /// 仅在 `LoggedOut` / `Unavailable` 时生效，其他状态原样返回。
    /// 最小模式下直接进入 `Unavailable`。存在上次的 wxid 时依次尝试：
    /// 网关仍在线则直接恢复，其次唤醒登录，最后回退到二维码登录。
    /// 初始阶段的网关错误直接返回给调用方。
    pub async fn begin_login(self: &Arc<Self>, mode: SystemMode) -> GatewayResult<LoginState> {
        let mut core = self.core.lock().await;

        match core.state {
            LoginState::LoggedOut | LoginState::Unavailable => {}
            _ => return Ok(core.state.clone()),
        }

        if mode == SystemMode::Degraded {
            info!(target: "Session", "最小模式运行，跳过登录");
            self.set_state(&mut core, LoginState::Unavailable);
            return Ok(core.state.clone());
        }

        let wxid = core.previous.wxid.clone();
        if !wxid.is_empty() {
            if self.try_resume(&mut core, &wxid).await? {
                self.start_heartbeat(wxid);
                return Ok(core.state.clone());
            }

            match self.gateway.awaken_login(&wxid).await {
                Ok(uuid) => {
                    info!(target: "Session", wxid = %wxid, "唤醒登录成功，请在手机上确认");
                    let attempt = LoginAttempt::new(uuid, "", &core.session.device_id);
                    self.enter_attempt(&mut core, attempt);
                    return Ok(core.state.clone());
                }
                Err(e @ GatewayError::Unreachable { .. }) => return Err(e),
                Err(e) => {
                    info!(target: "Session", reason = %e, "唤醒登录失败，使用二维码登录");
                }
            }
        }

        let qr = self
            .gateway
            .request_qr_code(
                &core.session.device_name,
                &core.session.device_id,
                self.proxy.as_ref(),
            )
            .await?;
        let attempt = LoginAttempt::new(qr.uuid, qr.url, &core.session.device_id);
        self.enter_attempt(&mut core, attempt);
        Ok(core.state.clone())
    }

    /// 网关仍保持上次会话时免扫码恢复
    async fn try_resume(&self, core: &mut Core, wxid: &str) -> GatewayResult<bool> {
        match self.gateway.cached_info(wxid).await {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(false),
            Err(e @ GatewayError::Unreachable { .. }) => return Err(e),
            Err(e) => {
                debug!(target: "Session", error = %e, "获取缓存登录信息失败");
                return Ok(false);
            }
        }

        match self.gateway.heartbeat(wxid).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e @ GatewayError::Unreachable { .. }) => return Err(e),
            Err(e) => {
                debug!(target: "Session", error = %e, "恢复会话心跳失败");
                return Ok(false);
            }
        }

        let mut session = core.previous.clone();
        session.online = true;
        session.last_active = unix_now();
        self.enter_logged_in(core, session).await;
        info!(target: "Session", wxid = %wxid, "已恢复上次登录会话");
        Ok(true)
    }

    fn enter_attempt(&self, core: &mut Core, attempt: LoginAttempt) {
        if attempt.qr_url.is_empty() {
            info!(target: "Session", uuid = %attempt.uuid, "等待登录确认");
        } else {
            info!(target: "Session", uuid = %attempt.uuid, url = %attempt.qr_url, "请使用微信扫描二维码登录");
        }
        core.attempt_started = Instant::now();
        core.refresh_pending = false;
        self.set_state(core, LoginState::AwaitingScan(attempt.clone()));
        self.set_state(
            core,
            LoginState::Polling {
                attempt,
                attempt_count: 0,
            },
        );
    }

    async fn enter_logged_in(&self, core: &mut Core, session: Session) {
        core.session = session.clone();
        core.previous = session.clone();
        core.refresh_failures = 0;
        self.persist(&session).await;

        match self.gateway.start_auto_heartbeat(&session.wxid).await {
            Ok(true) => info!(target: "Session", "已开启自动心跳"),
            Ok(false) => debug!(target: "Session", "网关未开启自动心跳"),
            Err(e) => warn!(target: "Session", error = %e, "开启自动心跳失败"),
        }

        self.set_state(core, LoginState::LoggedIn(session));
    }

    /// 执行一次扫码状态检查并完成对应的状态迁移
    pub async fn poll_once(self: &Arc<Self>) -> GatewayResult<LoginState> {
        Ok(self.poll_step().await?.0)
    }

    /// 返回迁移后的状态和下一次检查前的等待时间
    async fn poll_step(self: &Arc<Self>) -> GatewayResult<(LoginState, Duration)> {
        let mut core = self.core.lock().await;

        let (mut attempt, attempt_count) = match &core.state {
            LoginState::Polling {
                attempt,
                attempt_count,
            } => (attempt.clone(), *attempt_count),
            LoginState::AwaitingScan(attempt) => (attempt.clone(), 0),
            other => return Ok((other.clone(), self.policy.poll_interval)),
        };

        if core.refresh_pending {
            let delay = self.refresh(&mut core, "重新获取二维码").await?;
            return Ok((core.state.clone(), delay));
        }

        if core.attempt_started.elapsed() >= self.policy.total_polling_timeout {
            let delay = self.refresh(&mut core, "登录等待超时").await?;
            return Ok((core.state.clone(), delay));
        }

        match self
            .gateway
            .check_login_uuid(&attempt.uuid, &attempt.device_id)
            .await
        {
            Ok(LoginCheck::Confirmed(identity)) => {
                let wxid = identity.wxid.clone();
                self.complete_login(&mut core, &identity).await;
                // 持有状态锁时启动，登出一定能看到心跳句柄
                self.start_heartbeat(wxid);
                Ok((core.state.clone(), self.policy.poll_interval))
            }
            Ok(LoginCheck::Pending(remaining)) if self.policy.should_refresh(remaining) => {
                info!(target: "Session", remaining, "二维码即将过期");
                let delay = self.refresh(&mut core, "二维码即将过期").await?;
                Ok((core.state.clone(), delay))
            }
            Ok(LoginCheck::Pending(remaining)) => {
                debug!(target: "Session", remaining, "等待扫码");
                attempt.expires_in = Some(remaining);
                self.set_state(
                    &mut core,
                    LoginState::Polling {
                        attempt,
                        attempt_count: 0,
                    },
                );
                Ok((core.state.clone(), self.policy.poll_interval))
            }
            Err(e) => match self.policy.classify(&e) {
                FailureAction::RefreshQr => {
                    info!(target: "Session", reason = %e, "二维码已失效");
                    let delay = self.refresh(&mut core, "二维码已失效").await?;
                    Ok((core.state.clone(), delay))
                }
                FailureAction::Retry => {
                    let count = attempt_count + 1;
                    warn!(
                        target: "Session",
                        error = %e,
                        "检查登录状态失败 ({}/{})",
                        count,
                        self.policy.max_consecutive_failures
                    );
                    if count >= self.policy.max_consecutive_failures {
                        let delay = self.refresh(&mut core, "连续检查失败").await?;
                        return Ok((core.state.clone(), delay));
                    }
                    self.set_state(
                        &mut core,
                        LoginState::Polling {
                            attempt,
                            attempt_count: count,
                        },
                    );
                    Ok((core.state.clone(), self.policy.error_backoff))
                }
            },
        }
    }

    /// 重新获取二维码；连续失败达到上限时返回错误并回到 `LoggedOut`
    async fn refresh(&self, core: &mut Core, reason: &str) -> GatewayResult<Duration> {
        info!(target: "Session", "{}，正在刷新二维码", reason);

        let result = self
            .gateway
            .request_qr_code(
                &core.session.device_name,
                &core.session.device_id,
                self.proxy.as_ref(),
            )
            .await;

        match result {
            Ok(qr) => {
                core.refresh_failures = 0;
                let attempt = LoginAttempt::new(qr.uuid, qr.url, &core.session.device_id);
                self.enter_attempt(core, attempt);
                Ok(self.policy.poll_interval)
            }
            Err(e) => {
                core.refresh_failures += 1;
                core.refresh_pending = true;
                warn!(
                    target: "Session",
                    error = %e,
                    "刷新二维码失败 ({}/{})",
                    core.refresh_failures,
                    self.policy.max_consecutive_failures
                );
                if core.refresh_failures >= self.policy.max_consecutive_failures {
                    core.refresh_failures = 0;
                    core.refresh_pending = false;
                    self.set_state(core, LoginState::LoggedOut);
                    return Err(e);
                }
                Ok(self.policy.error_backoff)
            }
        }
    }

    async fn complete_login(&self, core: &mut Core, identity: &Identity) {
        let mut session = core.session.clone();
        session.apply_identity(identity, unix_now());
        info!(
            target: "Session",
            wxid = %session.wxid,
            nickname = %session.nickname,
            "登录成功"
        );
        self.enter_logged_in(core, session).await;
    }

    /// 驱动完整登录流程，直到登录成功、进入最小模式或被登出
    pub async fn run_login(self: &Arc<Self>, mode: SystemMode) -> GatewayResult<LoginState> {
        let mut state = self.begin_login(mode).await?;
        let mut delay = self.policy.poll_interval;

        loop {
            match state {
                LoginState::AwaitingScan(_) | LoginState::Polling { .. } => {}
                done => return Ok(done),
            }
            tokio::time::sleep(delay).await;
            (state, delay) = self.poll_step().await?;
        }
    }

    // ------------------------------------------------------------------------
    // 3.2 心跳
    // ------------------------------------------------------------------------

    fn start_heartbeat(self: &Arc<Self>, wxid: String) {
        let weak = Arc::downgrade(self);
        let interval = self.policy.heartbeat_interval;
        let handle = tokio::spawn(heartbeat_loop(weak, wxid, interval));

        if let Ok(mut slot) = self.heartbeat.lock()
            && let Some(old) = slot.replace(handle)
        {
            old.abort();
        }
    }

    fn stop_heartbeat(&self) {
        if let Ok(mut slot) = self.heartbeat.lock()
            && let Some(handle) = slot.take()
        {
            handle.abort();
        }
    }

    /// 心跳任务是否在运行
    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// 处理一次心跳结果，返回是否继续心跳
    async fn heartbeat_tick(&self, wxid: &str, failures: &mut u32) -> bool {
        if !matches!(&*self.state_tx.borrow(), LoginState::LoggedIn(s) if s.wxid == wxid) {
            debug!(target: "Session", wxid, "会话已结束，停止心跳");
            return false;
        }

        let ok = match self.gateway.heartbeat(wxid).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(target: "Session", "心跳未被网关确认");
                false
            }
            Err(e) => {
                warn!(target: "Session", error = %e, "心跳失败");
                false
            }
        };

        if ok {
            *failures = 0;
            return true;
        }

        *failures += 1;
        if *failures < self.policy.max_heartbeat_failures {
            return true;
        }

        error!(target: "Session", "心跳连续失败 {} 次，会话已失效，需要重新登录", failures);
        let mut core = self.core.lock().await;
        if matches!(&core.state, LoginState::LoggedIn(s) if s.wxid == wxid) {
            core.session.clear_identity();
            core.previous = core.session.clone();
            let session = core.session.clone();
            self.persist(&session).await;
            self.set_state(&mut core, LoginState::LoggedOut);
        }
        false
    }

    // ------------------------------------------------------------------------
    // 3.3 登出与关闭
    // ------------------------------------------------------------------------

    /// 登出并清空会话；未登录时为无操作
    pub async fn logout(&self) -> WxbotResult<()> {
        let mut core = self.core.lock().await;
        self.stop_heartbeat();

        match &core.state {
            LoginState::LoggedOut | LoginState::Unavailable => return Ok(()),
            LoginState::LoggedIn(session) => {
                let wxid = session.wxid.clone();
                match self.gateway.logout(&wxid).await {
                    Ok(true) => info!(target: "Session", wxid = %wxid, "已退出登录"),
                    Ok(false) => warn!(target: "Session", "网关登出未成功，已清除本地登录状态"),
                    Err(e) => warn!(target: "Session", error = %e, "网关登出失败，已清除本地登录状态"),
                }
            }
            LoginState::AwaitingScan(_) | LoginState::Polling { .. } => {
                info!(target: "Session", "已取消登录");
            }
        }

        core.session.clear_identity();
        core.previous = core.session.clone();
        core.refresh_pending = false;
        core.refresh_failures = 0;
        let session = core.session.clone();
        self.set_state(&mut core, LoginState::LoggedOut);
        self.store.save(&session).await
    }

    /// 刷新最近活跃时间
    pub async fn touch(&self) {
        let mut core = self.core.lock().await;
        if !core.state.is_logged_in() {
            return;
        }
        core.session.last_active = unix_now();
        let session = core.session.clone();
        self.persist(&session).await;
        core.state = LoginState::LoggedIn(session.clone());
        self.state_tx.send_replace(LoginState::LoggedIn(session));
    }

    /// 进程退出前调用：停止心跳并将会话标记为离线
    ///
    /// 持久化失败只记录日志，不重试。
    pub async fn shutdown(&self) {
        self.stop_heartbeat();

        let mut core = self.core.lock().await;
        if !core.session.is_logged_in() {
            return;
        }

        let wxid = core.session.wxid.clone();
        if let Err(e) = self.gateway.stop_auto_heartbeat(&wxid).await {
            warn!(target: "Session", error = %e, "停止自动心跳失败");
        }

        core.session.online = false;
        core.session.last_active = unix_now();
        let session = core.session.clone();
        core.previous = session.clone();
        match self.store.save(&session).await {
            Ok(()) => info!(target: "Session", "会话已标记为离线"),
            Err(e) => error!(target: "Session", error = %e, "离线状态保存失败"),
        }
        if core.state.is_logged_in() {
            self.set_state(&mut core, LoginState::LoggedIn(session));
        }
    }
}

impl Drop for SessionMachine {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

async fn heartbeat_loop(machine: Weak<SessionMachine>, wxid: String, interval: Duration) {
    let mut failures = 0u32;
    loop {
        tokio::time::sleep(interval).await;
        let Some(machine) = machine.upgrade() else {
            break;
        };
        if !machine.heartbeat_tick(&wxid, &mut failures).await {
            break;
        }
    }
}

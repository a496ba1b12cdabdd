//! 操作者接口
//!
//! 每个操作一一对应核心模块的一个方法，并把结果转换为可序列化的状态载荷，
//! 供 Web 面板或命令行等外层使用。

use crate::plugin_manager::PluginManager;
use crate::plugin_registry::PluginRecord;
use crate::session::{LoginState, SessionMachine};
use crate::{LoginAttempt, PluginResult, Session};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// 插件操作的结构化结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>, plugin_id: Option<&str>) -> Self {
        Self {
            success: true,
            message: message.into(),
            plugin_id: plugin_id.map(str::to_string),
        }
    }

    pub fn failed(message: impl Into<String>, plugin_id: Option<&str>) -> Self {
        Self {
            success: false,
            message: message.into(),
            plugin_id: plugin_id.map(str::to_string),
        }
    }

    /// 失败时使用错误的显示文本作为消息
    pub fn from_result<T>(
        result: PluginResult<T>,
        plugin_id: Option<&str>,
        on_success: impl FnOnce(&T) -> String,
    ) -> Self {
        match result {
            Ok(value) => Self::ok(on_success(&value), plugin_id),
            Err(e) => Self::failed(e.to_string(), plugin_id),
        }
    }
}

/// 登录状态载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginStatus {
    pub state: &'static str,
    pub logged_in: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<Session>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<LoginAttempt>,
    /// 当前二维码上连续失败的检查次数
    pub attempt_count: u32,
}

impl From<&LoginState> for LoginStatus {
    fn from(state: &LoginState) -> Self {
        let (session, attempt_count) = match state {
            LoginState::LoggedIn(s) => (Some(s.clone()), 0),
            LoginState::Polling { attempt_count, .. } => (None, *attempt_count),
            _ => (None, 0),
        };
        Self {
            state: state.name(),
            logged_in: state.is_logged_in(),
            session,
            attempt: state.attempt().cloned(),
            attempt_count,
        }
    }
}

/// 操作者控制面板
#[derive(Clone)]
pub struct ControlPanel {
    session: Arc<SessionMachine>,
    plugins: Arc<PluginManager>,
}

impl ControlPanel {
    pub fn new(session: Arc<SessionMachine>, plugins: Arc<PluginManager>) -> Self {
        Self { session, plugins }
    }

    pub fn login_status(&self) -> LoginStatus {
        LoginStatus::from(&self.session.state())
    }

    pub fn qr_code(&self) -> Option<LoginAttempt> {
        self.session.qr_code()
    }

    pub async fn logout(&self) -> OperationResult {
        match self.session.logout().await {
            Ok(()) => OperationResult::ok("已退出登录", None),
            Err(e) => OperationResult::failed(format!("退出登录时保存会话失败: {e}"), None),
        }
    }

    pub async fn plugin_list(&self) -> Vec<PluginRecord> {
        self.plugins.rescan().await
    }

    pub async fn install(&self, package: &Path) -> OperationResult {
        let result = self.plugins.install(package, false).await;
        let id = result.as_ref().ok().map(|o| o.id.clone());
        OperationResult::from_result(result, id.as_deref(), |o| o.message())
    }

    pub async fn update(&self, package: &Path) -> OperationResult {
        let result = self.plugins.install(package, true).await;
        let id = result.as_ref().ok().map(|o| o.id.clone());
        OperationResult::from_result(result, id.as_deref(), |o| o.message())
    }

    pub async fn uninstall(&self, id: &str) -> OperationResult {
        let result = self.plugins.uninstall(id).await;
        OperationResult::from_result(result, Some(id), |_| format!("插件 {id} 已卸载"))
    }

    pub async fn enable(&self, id: &str) -> OperationResult {
        let result = self.plugins.enable(id).await;
        OperationResult::from_result(result, Some(id), |_| format!("插件 {id} 已启用"))
    }

    pub async fn disable(&self, id: &str) -> OperationResult {
        let result = self.plugins.disable(id).await;
        OperationResult::from_result(result, Some(id), |_| format!("插件 {id} 已禁用"))
    }

    pub async fn rollback(&self, id: &str) -> OperationResult {
        let result = self.plugins.rollback(id).await;
        OperationResult::from_result(result, Some(id), |o| {
            format!("插件 {id} 已回滚到版本 {}", o.version)
        })
    }
}

//! 会话持久化
//!
//! 将最近一次的登录身份保存为 JSON 文件，重启后用于免扫码恢复。

use crate::gateway::{create_device_id, create_device_name};
use crate::{Session, WxbotResult, write_atomic};
use std::path::{Path, PathBuf};
use tracing::warn;

/// 基于文件的会话记录
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取会话记录
    ///
    /// 文件不存在或内容损坏时返回空会话，不视为错误。
    pub async fn load(&self) -> Session {
        let content = match tokio::fs::read(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Session::default(),
            Err(e) => {
                warn!(target: "Session", path = %self.path.display(), error = %e, "会话记录读取失败，使用空会话");
                return Session::default();
            }
        };

        match serde_json::from_slice(&content) {
            Ok(session) => session,
            Err(e) => {
                warn!(target: "Session", path = %self.path.display(), error = %e, "会话记录已损坏，使用空会话");
                Session::default()
            }
        }
    }

    /// 原子写入会话记录，读者不会看到写了一半的文件
    pub async fn save(&self, session: &Session) -> WxbotResult<()> {
        let content = serde_json::to_vec_pretty(session)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &content)).await??;
        Ok(())
    }

    /// 读取会话记录，并在首次运行时生成设备信息
    pub async fn load_with_device(&self) -> Session {
        let mut session = self.load().await;
        if session.has_device() {
            return session;
        }

        if session.device_id.is_empty() {
            session.device_id = create_device_id(None);
        }
        if session.device_name.is_empty() {
            session.device_name = create_device_name();
        }
        if let Err(e) = self.save(&session).await {
            warn!(target: "Session", error = %e, "设备信息保存失败");
        }
        session
    }
}

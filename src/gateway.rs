//! 微信网关 HTTP 客户端
//!
//! 网关被视为黑盒 HTTP 服务，所有接口返回统一的响应包络：
//! `{"Success": bool, "Data": object, "Message": string}`。
//! 客户端本身无状态，登录状态由 [`crate::session::SessionMachine`] 持有。

use crate::{GatewayConfig, GatewayError, GatewayResult, Identity, ProxyConfig, WxbotError, WxbotResult};
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};
use url::Url;

/// 健康检查依次尝试的路径
pub const PROBE_PATHS: [&str; 5] = ["/IsRunning", "/is_running", "/ping", "/health", "/status"];

const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// 1. 类型定义
// ============================================================================

/// 网关签发的登录二维码
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrCode {
    pub uuid: String,
    pub url: String,
}

/// 扫码状态检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginCheck {
    /// 用户已在手机上确认
    Confirmed(Identity),
    /// 尚未确认，携带二维码剩余有效秒数
    Pending(u32),
}

/// 网关可用性诊断
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeReport {
    /// 某个健康检查路径返回了 200
    Healthy { path: String },
    /// 端口可连接，但 API 未正确响应（服务可能正在启动）
    Starting,
    /// 端口不可连接
    Absent,
}

impl ProbeReport {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

/// 网关接口抽象
///
/// 登录状态机只依赖该 trait，便于替换为其它实现。
#[async_trait]
pub trait Gateway: Send + Sync {
    /// 获取登录二维码
    async fn request_qr_code(
        &self,
        device_name: &str,
        device_id: &str,
        proxy: Option<&ProxyConfig>,
    ) -> GatewayResult<QrCode>;

    /// 检查二维码扫码状态
    async fn check_login_uuid(&self, uuid: &str, device_id: &str) -> GatewayResult<LoginCheck>;

    async fn heartbeat(&self, wxid: &str) -> GatewayResult<bool>;

    async fn logout(&self, wxid: &str) -> GatewayResult<bool>;

    /// 唤醒登录，成功时返回新的 uuid（需在手机上确认）
    async fn awaken_login(&self, wxid: &str) -> GatewayResult<String>;

    /// 尝试一组健康检查路径，任意一个返回 200 即视为可用
    async fn probe_availability(&self) -> bool;

    /// 获取网关缓存的登录信息，不存在时返回 `None`
    async fn cached_info(&self, _wxid: &str) -> GatewayResult<Option<Value>> {
        Ok(None)
    }

    async fn start_auto_heartbeat(&self, _wxid: &str) -> GatewayResult<bool> {
        Ok(false)
    }

    async fn stop_auto_heartbeat(&self, _wxid: &str) -> GatewayResult<bool> {
        Ok(false)
    }

    async fn auto_heartbeat_status(&self, _wxid: &str) -> GatewayResult<bool> {
        Ok(false)
    }

    /// 拉取新消息
    async fn sync_messages(&self, _wxid: &str) -> GatewayResult<Vec<Value>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// 2. 响应包络解析
// ============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "Success", default)]
    success: bool,
    #[serde(rename = "Data", default)]
    data: Value,
    #[serde(rename = "Message", default)]
    message: Option<String>,
    /// 部分接口把字段放在顶层（如 GetQRCode 的 uuid / QR_url）
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Envelope {
    fn message(&self) -> &str {
        match self.message.as_deref() {
            Some(m) if !m.is_empty() => m,
            _ => "未知错误",
        }
    }

    fn ensure_success(&self, endpoint: &str) -> GatewayResult<()> {
        if self.success {
            Ok(())
        } else {
            Err(GatewayError::rejected(endpoint, self.message()))
        }
    }
}

fn str_at<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn owned_str(value: &Value, key: &str) -> String {
    str_at(value, key).unwrap_or_default().to_string()
}

pub(crate) fn parse_qr_code(endpoint: &str, env: Envelope) -> GatewayResult<QrCode> {
    env.ensure_success(endpoint)?;

    let top = Value::Object(env.extra);
    let uuid = str_at(&env.data, "Uuid")
        .or_else(|| str_at(&env.data, "uuid"))
        .or_else(|| str_at(&top, "uuid"))
        .ok_or_else(|| GatewayError::rejected(endpoint, "响应中缺少 uuid"))?;
    let url = str_at(&env.data, "QrUrl")
        .or_else(|| str_at(&top, "QR_url"))
        .unwrap_or_default();

    Ok(QrCode {
        uuid: uuid.to_string(),
        url: url.to_string(),
    })
}

pub(crate) fn parse_login_check(endpoint: &str, env: Envelope) -> GatewayResult<LoginCheck> {
    env.ensure_success(endpoint)?;

    if let Some(account) = env.data.get("acctSectResp").filter(|v| v.is_object()) {
        let identity = Identity {
            wxid: owned_str(account, "userName"),
            nickname: owned_str(account, "nickName"),
            alias: owned_str(account, "alias"),
            phone: owned_str(account, "bindMobile"),
        };
        if identity.wxid.is_empty() {
            return Err(GatewayError::rejected(endpoint, "登录确认响应中缺少 userName"));
        }
        return Ok(LoginCheck::Confirmed(identity));
    }

    let remaining = env
        .data
        .get("expiredTime")
        .and_then(Value::as_i64)
        .ok_or_else(|| GatewayError::rejected(endpoint, "响应中缺少 expiredTime"))?;
    Ok(LoginCheck::Pending(remaining.clamp(0, u32::MAX as i64) as u32))
}

pub(crate) fn parse_awaken(endpoint: &str, env: Envelope) -> GatewayResult<String> {
    let uuid = env
        .data
        .get("QrCodeResponse")
        .and_then(|r| str_at(r, "Uuid"))
        .map(str::to_string);

    match uuid {
        Some(uuid) if env.success => Ok(uuid),
        _ => Err(GatewayError::LoginRequired(format!("{endpoint}: {}", env.message()))),
    }
}

pub(crate) fn parse_cached_info(env: Envelope) -> Option<Value> {
    let has_data = env.data.as_object().is_some_and(|m| !m.is_empty());
    (env.success && has_data).then_some(env.data)
}

// ============================================================================
// 3. 设备信息
// ============================================================================

const FIRST_NAMES: &[&str] = &[
    "Oliver", "Emma", "Liam", "Ava", "Noah", "Sophia", "Elijah", "Isabella", "James", "Mia",
    "William", "Amelia", "Benjamin", "Harper", "Lucas", "Evelyn", "Henry", "Abigail",
    "Alexander", "Ella", "Jackson", "Scarlett", "Sebastian", "Grace", "Aiden", "Chloe",
    "Matthew", "Zoey", "Samuel", "Lily", "David", "Aria", "Joseph", "Riley", "Carter", "Nora",
    "Owen", "Luna", "Daniel", "Sofia", "Gabriel", "Ellie", "Avery", "Isaac", "Mila", "Leo",
    "Julian", "Layla",
];

const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Rodriguez",
    "Martinez", "Hernandez", "Lopez", "Gonzalez", "Wilson", "Anderson", "Thomas", "Taylor",
    "Moore", "Jackson", "Martin", "Lee", "Perez", "Thompson", "White", "Harris", "Sanchez",
    "Clark", "Ramirez", "Lewis", "Robinson", "Walker", "Young", "Allen", "King", "Wright",
    "Scott", "Torres", "Nguyen", "Hill", "Flores", "Green", "Adams", "Nelson", "Baker", "Hall",
    "Rivera", "Campbell", "Mitchell", "Roberts", "Gomez", "Phillips", "Evans",
];

const ASCII_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// 生成随机设备名，如 `Emma Lee's Pad`
pub fn create_device_name() -> String {
    let mut rng = rand::rng();
    let first = FIRST_NAMES.choose(&mut rng).copied().unwrap_or("Oliver");
    let last = LAST_NAMES.choose(&mut rng).copied().unwrap_or("Smith");
    format!("{first} {last}'s Pad")
}

/// 生成设备 ID：`"49"` + md5(seed) 的后 30 位
///
/// 未提供种子时使用 15 位随机字母。
pub fn create_device_id(seed: Option<&str>) -> String {
    let seed = match seed {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            let mut rng = rand::rng();
            (0..15)
                .map(|_| ASCII_LETTERS.choose(&mut rng).copied().unwrap_or(b'a') as char)
                .collect()
        }
    };
    let digest = format!("{:x}", md5::compute(seed.as_bytes()));
    format!("49{}", &digest[2..])
}

// ============================================================================
// 4. HTTP 实现
// ============================================================================

/// 基于 reqwest 的网关客户端
#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: Url,
    probe_timeout: Duration,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> WxbotResult<Self> {
        let base_url = Url::parse(&format!("http://{}:{}/", config.host, config.port))
            .map_err(|e| WxbotError::Config(format!("网关地址无效: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .no_proxy()
            .build()
            .map_err(|e| WxbotError::Config(format!("HTTP 客户端初始化失败: {e}")))?;

        Ok(Self {
            client,
            base_url,
            probe_timeout: Duration::from_millis(config.probe_timeout_ms).min(MAX_PROBE_TIMEOUT),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), endpoint)
    }

    async fn post(&self, endpoint: &str, body: Value) -> GatewayResult<Envelope> {
        debug!(target: "Gateway", endpoint, "请求网关");

        let resp = self
            .client
            .post(self.url(endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::unreachable(endpoint, e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| GatewayError::unreachable(endpoint, e))?;

        serde_json::from_str(&text).map_err(|e| {
            GatewayError::rejected(endpoint, format!("HTTP {status}，响应解析失败: {e}"))
        })
    }

    async fn post_wxid(&self, endpoint: &str, wxid: &str) -> GatewayResult<Envelope> {
        self.post(endpoint, json!({ "Wxid": wxid })).await
    }

    /// 详细诊断：区分“服务不存在”和“服务正在启动”
    pub async fn probe_diagnostics(&self) -> ProbeReport {
        for path in PROBE_PATHS {
            let result = self
                .client
                .get(self.url(path))
                .timeout(self.probe_timeout)
                .send()
                .await;
            if let Ok(resp) = result
                && resp.status() == reqwest::StatusCode::OK
            {
                return ProbeReport::Healthy {
                    path: path.to_string(),
                };
            }
        }

        let host = self.base_url.host_str().unwrap_or("127.0.0.1").to_string();
        let port = self.base_url.port_or_known_default().unwrap_or(80);
        match tokio::time::timeout(TCP_PROBE_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(_)) => {
                info!(target: "Gateway", "端口 {} 可以连接，但 API 服务未正确响应", port);
                ProbeReport::Starting
            }
            _ => ProbeReport::Absent,
        }
    }
}

#[async_trait]
impl Gateway for GatewayClient {
    async fn request_qr_code(
        &self,
        device_name: &str,
        device_id: &str,
        proxy: Option<&ProxyConfig>,
    ) -> GatewayResult<QrCode> {
        const EP: &str = "/GetQRCode";
        let mut body = json!({ "DeviceName": device_name, "DeviceID": device_id });
        if let Some(p) = proxy {
            body["ProxyInfo"] = json!({
                "ProxyIp": format!("{}:{}", p.ip, p.port),
                "ProxyUser": p.username,
                "ProxyPassword": p.password,
            });
        }
        parse_qr_code(EP, self.post(EP, body).await?)
    }

    async fn check_login_uuid(&self, uuid: &str, device_id: &str) -> GatewayResult<LoginCheck> {
        const EP: &str = "/CheckUuid";
        let env = self
            .post(EP, json!({ "Uuid": uuid, "DeviceID": device_id }))
            .await?;
        parse_login_check(EP, env)
    }

    async fn heartbeat(&self, wxid: &str) -> GatewayResult<bool> {
        Ok(self.post_wxid("/Heartbeat", wxid).await?.success)
    }

    async fn logout(&self, wxid: &str) -> GatewayResult<bool> {
        Ok(self.post_wxid("/LogOut", wxid).await?.success)
    }

    async fn awaken_login(&self, wxid: &str) -> GatewayResult<String> {
        const EP: &str = "/AwakenLogin";
        parse_awaken(EP, self.post_wxid(EP, wxid).await?)
    }

    async fn probe_availability(&self) -> bool {
        self.probe_diagnostics().await.is_healthy()
    }

    async fn cached_info(&self, wxid: &str) -> GatewayResult<Option<Value>> {
        Ok(parse_cached_info(self.post_wxid("/GetCachedInfo", wxid).await?))
    }

    async fn start_auto_heartbeat(&self, wxid: &str) -> GatewayResult<bool> {
        Ok(self.post_wxid("/AutoHeartbeatStart", wxid).await?.success)
    }

    async fn stop_auto_heartbeat(&self, wxid: &str) -> GatewayResult<bool> {
        Ok(self.post_wxid("/AutoHeartbeatStop", wxid).await?.success)
    }

    async fn auto_heartbeat_status(&self, wxid: &str) -> GatewayResult<bool> {
        const EP: &str = "/AutoHeartbeatStatus";
        let env = self.post_wxid(EP, wxid).await?;
        env.ensure_success(EP)?;
        Ok(env
            .data
            .get("Running")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn sync_messages(&self, wxid: &str) -> GatewayResult<Vec<Value>> {
        const EP: &str = "/Sync";
        let env = self
            .post(EP, json!({ "Wxid": wxid, "Scene": 0, "Synckey": "" }))
            .await?;
        env.ensure_success(EP)?;
        Ok(match env.data.get("AddMsgs") {
            Some(Value::Array(msgs)) => msgs.clone(),
            _ => Vec::new(),
        })
    }
}

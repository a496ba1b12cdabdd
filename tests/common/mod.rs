#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use wxbot::gateway::{Gateway, LoginCheck, QrCode};
use wxbot::{GatewayError, GatewayResult, ProxyConfig};

/// 按脚本返回结果的网关，队列为空时使用默认值
pub struct FakeGateway {
    available: AtomicBool,
    issued: AtomicU32,
    qr_codes: Mutex<VecDeque<GatewayResult<QrCode>>>,
    checks: Mutex<VecDeque<GatewayResult<LoginCheck>>>,
    heartbeats: Mutex<VecDeque<GatewayResult<bool>>>,
    messages: Mutex<VecDeque<GatewayResult<Vec<Value>>>>,
    awaken: Mutex<Option<GatewayResult<String>>>,
    cached: Mutex<Option<Value>>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            available: AtomicBool::new(true),
            issued: AtomicU32::new(0),
            qr_codes: Mutex::default(),
            checks: Mutex::default(),
            heartbeats: Mutex::default(),
            messages: Mutex::default(),
            awaken: Mutex::default(),
            cached: Mutex::default(),
            calls: Mutex::default(),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn push_qr(&self, result: GatewayResult<QrCode>) {
        self.qr_codes.lock().unwrap().push_back(result);
    }

    pub fn push_check(&self, result: GatewayResult<LoginCheck>) {
        self.checks.lock().unwrap().push_back(result);
    }

    pub fn push_heartbeat(&self, result: GatewayResult<bool>) {
        self.heartbeats.lock().unwrap().push_back(result);
    }

    pub fn push_messages(&self, result: GatewayResult<Vec<Value>>) {
        self.messages.lock().unwrap().push_back(result);
    }

    pub fn set_awaken(&self, result: GatewayResult<String>) {
        *self.awaken.lock().unwrap() = Some(result);
    }

    pub fn set_cached(&self, info: Value) {
        *self.cached.lock().unwrap() = Some(info);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == name).count()
    }

    fn record(&self, name: &'static str) {
        self.calls.lock().unwrap().push(name);
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn request_qr_code(
        &self,
        _device_name: &str,
        _device_id: &str,
        _proxy: Option<&ProxyConfig>,
    ) -> GatewayResult<QrCode> {
        self.record("qr");
        if let Some(result) = self.qr_codes.lock().unwrap().pop_front() {
            return result;
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(QrCode {
            uuid: format!("uuid-{n}"),
            url: format!("http://qr.test/{n}"),
        })
    }

    async fn check_login_uuid(&self, _uuid: &str, _device_id: &str) -> GatewayResult<LoginCheck> {
        self.record("check");
        self.checks
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(LoginCheck::Pending(200)))
    }

    async fn heartbeat(&self, _wxid: &str) -> GatewayResult<bool> {
        self.record("heartbeat");
        self.heartbeats.lock().unwrap().pop_front().unwrap_or(Ok(true))
    }

    async fn logout(&self, _wxid: &str) -> GatewayResult<bool> {
        self.record("logout");
        Ok(true)
    }

    async fn awaken_login(&self, _wxid: &str) -> GatewayResult<String> {
        self.record("awaken");
        self.awaken
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Err(GatewayError::LoginRequired("需要扫码".into())))
    }

    async fn probe_availability(&self) -> bool {
        self.record("probe");
        self.available.load(Ordering::SeqCst)
    }

    async fn cached_info(&self, _wxid: &str) -> GatewayResult<Option<Value>> {
        self.record("cached_info");
        Ok(self.cached.lock().unwrap().clone())
    }

    async fn start_auto_heartbeat(&self, _wxid: &str) -> GatewayResult<bool> {
        self.record("start_auto_heartbeat");
        Ok(true)
    }

    async fn stop_auto_heartbeat(&self, _wxid: &str) -> GatewayResult<bool> {
        self.record("stop_auto_heartbeat");
        Ok(true)
    }

    async fn sync_messages(&self, _wxid: &str) -> GatewayResult<Vec<Value>> {
        self.record("sync");
        self.messages.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
    }
}

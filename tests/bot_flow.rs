mod common;

use async_trait::async_trait;
use common::FakeGateway;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wxbot::gateway::LoginCheck;
use wxbot::plugin::{ChatMessage, EventResult, Plugin, PluginContext, Unloadable};
use wxbot::session::SystemMode;
use wxbot::session_store::SessionStore;
use wxbot::{GatewayError, Identity, WxbotResult, bot::WxBot};

struct Recorder {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Plugin for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_message(&self, _ctx: &PluginContext, msg: &ChatMessage) -> WxbotResult<EventResult> {
        self.seen.lock().unwrap().push(msg.content.clone());
        Ok(EventResult::Continue)
    }

    fn as_unloadable(&self) -> Option<&dyn Unloadable> {
        Some(self)
    }
}

#[async_trait]
impl Unloadable for Recorder {
    async fn unload(&self, _ctx: &PluginContext) -> WxbotResult<()> {
        self.seen.lock().unwrap().push("unloaded".into());
        Ok(())
    }
}

fn write_config(dir: &Path, degraded_on_unavailable: bool) -> std::path::PathBuf {
    let root = dir.display();
    let path = dir.join("config.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[core]
data_dir = "{root}/data"
log_level = "warn"

[gateway]
startup_wait_secs = 0

[login]
poll_interval_secs = 1
degraded_on_unavailable = {degraded_on_unavailable}

[plugins]
dir = "{root}/plugins"
backup_dir = "{root}/backups"
"#
        ),
    )
    .unwrap();
    path
}

fn install_recorder(dir: &Path) {
    let plugin = dir.join("plugins").join("recorder");
    std::fs::create_dir_all(&plugin).unwrap();
    std::fs::write(
        plugin.join("info.json"),
        json!({ "id": "recorder", "version": "1.0.0" }).to_string(),
    )
    .unwrap();
}

fn text(content: &str) -> serde_json::Value {
    json!({
        "MsgId": 1,
        "MsgType": 1,
        "FromUserName": { "string": "wxid_friend" },
        "ToUserName": { "string": "wxid_bot" },
        "Content": { "string": content },
    })
}

#[tokio::test]
async fn unavailable_gateway_starts_in_degraded_mode() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    gw.set_available(false);

    let bot = WxBot::builder()
        .config_path(write_config(dir.path(), true))
        .gateway(gw.clone())
        .build();
    let running = bot.start().await.unwrap();

    assert_eq!(running.mode(), SystemMode::Degraded);
    assert_eq!(running.control().login_status().state, "unavailable");
    running.shutdown().await;
    assert!(gw.calls().iter().all(|c| *c == "probe"));
}

#[tokio::test]
async fn unavailable_gateway_is_fatal_without_degraded_mode() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    gw.set_available(false);

    let bot = WxBot::builder()
        .config_path(write_config(dir.path(), false))
        .gateway(gw)
        .build();
    assert!(bot.start().await.is_err());
}

#[tokio::test]
async fn failed_login_start_unloads_plugins() {
    let dir = tempfile::tempdir().unwrap();
    install_recorder(dir.path());
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();

    let gw = FakeGateway::new();
    gw.push_qr(Err(GatewayError::unreachable("/GetQRCode", "connection refused")));

    let recorder_seen = seen.clone();
    let bot = WxBot::builder()
        .config_path(write_config(dir.path(), true))
        .gateway(gw)
        .plugin("recorder", move || Recorder {
            seen: recorder_seen.clone(),
        })
        .build();
    assert!(bot.start().await.is_err());
    assert_eq!(*seen.lock().unwrap(), ["unloaded"]);
}

#[tokio::test]
async fn backlog_is_skipped_and_new_messages_reach_plugins() {
    let dir = tempfile::tempdir().unwrap();
    install_recorder(dir.path());
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();

    let gw = FakeGateway::new();
    gw.push_check(Ok(LoginCheck::Confirmed(Identity {
        wxid: "wxid_bot".into(),
        nickname: "Bot".into(),
        ..Default::default()
    })));
    gw.push_messages(Ok(vec![text("backlog")]));
    for _ in 0..3 {
        gw.push_messages(Ok(Vec::new()));
    }
    gw.push_messages(Ok(vec![text("live")]));

    let recorder_seen = seen.clone();
    let bot = WxBot::builder()
        .config_path(write_config(dir.path(), true))
        .gateway(gw.clone())
        .plugin("recorder", move || Recorder {
            seen: recorder_seen.clone(),
        })
        .build();
    let running = bot.start().await.unwrap();
    assert_eq!(running.mode(), SystemMode::Normal);
    assert!(running.plugins().is_loaded("recorder").await);

    tokio::time::timeout(Duration::from_secs(15), async {
        while !seen.lock().unwrap().contains(&"live".to_string()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*seen.lock().unwrap(), ["live"]);
    assert!(running.control().login_status().logged_in);

    running.shutdown().await;
    assert_eq!(*seen.lock().unwrap(), ["live", "unloaded"]);
    let saved = SessionStore::new(dir.path().join("data").join("robot_stat.json"))
        .load()
        .await;
    assert_eq!(saved.wxid, "wxid_bot");
    assert!(!saved.online);
}

mod common;

use common::FakeGateway;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use wxbot::gateway::{LoginCheck, QrCode};
use wxbot::session::{LoginState, RetryPolicy, SessionMachine, SystemMode};
use wxbot::session_store::SessionStore;
use wxbot::{GatewayError, Identity, Session};

fn store(dir: &Path) -> SessionStore {
    SessionStore::new(dir.join("robot_stat.json"))
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        poll_interval: Duration::from_millis(5),
        error_backoff: Duration::from_millis(5),
        heartbeat_interval: Duration::from_millis(10),
        ..RetryPolicy::default()
    }
}

async fn machine(gw: &Arc<FakeGateway>, dir: &Path, policy: RetryPolicy) -> Arc<SessionMachine> {
    SessionMachine::new(gw.clone(), store(dir), policy, None).await
}

fn identity(wxid: &str) -> Identity {
    Identity {
        wxid: wxid.into(),
        nickname: "Bot".into(),
        ..Default::default()
    }
}

fn polling(state: &LoginState) -> (String, u32) {
    match state {
        LoginState::Polling {
            attempt,
            attempt_count,
        } => (attempt.uuid.clone(), *attempt_count),
        other => panic!("expected polling, got {other:?}"),
    }
}

async fn logged_in(gw: &Arc<FakeGateway>, dir: &Path, policy: RetryPolicy) -> Arc<SessionMachine> {
    let m = machine(gw, dir, policy).await;
    m.begin_login(SystemMode::Normal).await.unwrap();
    gw.push_check(Ok(LoginCheck::Confirmed(identity("wxid_bot"))));
    assert!(m.poll_once().await.unwrap().is_logged_in());
    m
}

async fn write_previous(dir: &Path, wxid: &str) {
    let session = Session {
        wxid: wxid.into(),
        nickname: "Old".into(),
        device_id: "49deadbeef".into(),
        device_name: "Ann's Pad".into(),
        online: false,
        ..Default::default()
    };
    store(dir).save(&session).await.unwrap();
}

// ============================================================================
// 二维码轮询
// ============================================================================

#[tokio::test]
async fn new_login_enters_polling_with_zero_failures() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;

    let state = m.begin_login(SystemMode::Normal).await.unwrap();
    assert_eq!(polling(&state), ("uuid-1".to_string(), 0));
    let qr = m.qr_code().unwrap();
    assert_eq!(qr.qr_url, "http://qr.test/1");
    assert!(!qr.device_id.is_empty());

    // 登录进行中再次调用不会重新获取二维码
    m.begin_login(SystemMode::Normal).await.unwrap();
    assert_eq!(gw.count("qr"), 1);
    assert_eq!(gw.count("awaken"), 0);
}

#[tokio::test]
async fn pending_above_threshold_keeps_the_same_code() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;
    m.begin_login(SystemMode::Normal).await.unwrap();

    gw.push_check(Ok(LoginCheck::Pending(31)));
    let state = m.poll_once().await.unwrap();
    assert_eq!(polling(&state), ("uuid-1".to_string(), 0));
    assert_eq!(state.attempt().unwrap().expires_in, Some(31));
    assert_eq!(gw.count("qr"), 1);
}

#[tokio::test(start_paused = true)]
async fn code_is_refreshed_when_thirty_seconds_remain() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;
    m.begin_login(SystemMode::Normal).await.unwrap();

    tokio::time::advance(Duration::from_secs(265)).await;
    gw.push_check(Ok(LoginCheck::Pending(35)));
    assert_eq!(polling(&m.poll_once().await.unwrap()).0, "uuid-1");

    tokio::time::advance(Duration::from_secs(5)).await;
    gw.push_check(Ok(LoginCheck::Pending(30)));
    let state = m.poll_once().await.unwrap();
    let (uuid, count) = polling(&state);
    assert_ne!(uuid, "uuid-1");
    assert_eq!(count, 0);
    assert_eq!(gw.count("qr"), 2);
}

#[tokio::test(start_paused = true)]
async fn polling_timeout_refreshes_without_checking() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;
    m.begin_login(SystemMode::Normal).await.unwrap();

    tokio::time::advance(Duration::from_secs(300)).await;
    let state = m.poll_once().await.unwrap();
    assert_eq!(polling(&state), ("uuid-2".to_string(), 0));
    assert_eq!(gw.count("check"), 0);
}

#[tokio::test]
async fn unknown_uuid_refreshes_the_code() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;
    m.begin_login(SystemMode::Normal).await.unwrap();

    gw.push_check(Err(GatewayError::rejected("/CheckUuid", "UUID not found")));
    let state = m.poll_once().await.unwrap();
    assert_eq!(polling(&state), ("uuid-2".to_string(), 0));
}

#[tokio::test]
async fn three_consecutive_failures_refresh_the_code() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;
    m.begin_login(SystemMode::Normal).await.unwrap();

    for _ in 0..3 {
        gw.push_check(Err(GatewayError::unreachable("/CheckUuid", "connection refused")));
    }

    assert_eq!(polling(&m.poll_once().await.unwrap()), ("uuid-1".to_string(), 1));
    assert_eq!(polling(&m.poll_once().await.unwrap()), ("uuid-1".to_string(), 2));
    assert_eq!(polling(&m.poll_once().await.unwrap()), ("uuid-2".to_string(), 0));
}

#[tokio::test]
async fn pending_resets_the_failure_count() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;
    m.begin_login(SystemMode::Normal).await.unwrap();

    gw.push_check(Err(GatewayError::rejected("/CheckUuid", "busy")));
    gw.push_check(Ok(LoginCheck::Pending(120)));
    assert_eq!(polling(&m.poll_once().await.unwrap()).1, 1);
    assert_eq!(polling(&m.poll_once().await.unwrap()).1, 0);
}

#[tokio::test]
async fn repeated_refresh_failures_return_to_logged_out() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;
    m.begin_login(SystemMode::Normal).await.unwrap();

    gw.push_check(Ok(LoginCheck::Pending(10)));
    for _ in 0..3 {
        gw.push_qr(Err(GatewayError::rejected("/GetQRCode", "rate limited")));
    }

    assert_eq!(polling(&m.poll_once().await.unwrap()).0, "uuid-1");
    assert_eq!(polling(&m.poll_once().await.unwrap()).0, "uuid-1");
    assert!(m.poll_once().await.is_err());
    assert_eq!(m.state(), LoginState::LoggedOut);
}

// ============================================================================
// 登录完成
// ============================================================================

#[tokio::test]
async fn confirmed_login_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = logged_in(&gw, dir.path(), RetryPolicy::default()).await;

    let LoginState::LoggedIn(session) = m.state() else {
        panic!("expected logged in");
    };
    assert_eq!(session.wxid, "wxid_bot");
    assert!(session.online);

    let saved = store(dir.path()).load().await;
    assert_eq!(saved.wxid, "wxid_bot");
    assert_eq!(saved.nickname, "Bot");
    assert_eq!(saved.device_id, session.device_id);
    assert!(m.heartbeat_running());
    assert_eq!(gw.count("start_auto_heartbeat"), 1);
}

#[tokio::test]
async fn run_login_drives_polling_until_confirmed() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    gw.push_check(Ok(LoginCheck::Pending(200)));
    gw.push_check(Err(GatewayError::rejected("/CheckUuid", "busy")));
    gw.push_check(Ok(LoginCheck::Confirmed(identity("wxid_run"))));
    let m = machine(&gw, dir.path(), fast_policy()).await;

    let state = tokio::time::timeout(Duration::from_secs(5), m.run_login(SystemMode::Normal))
        .await
        .unwrap()
        .unwrap();
    assert!(state.is_logged_in());
    assert_eq!(gw.count("check"), 3);
}

#[tokio::test]
async fn unreachable_gateway_is_fatal_at_start() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    gw.push_qr(Err(GatewayError::unreachable("/GetQRCode", "connection refused")));
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;

    let err = m.begin_login(SystemMode::Normal).await.unwrap_err();
    assert!(err.is_unreachable());
    assert_eq!(m.state(), LoginState::LoggedOut);
}

// ============================================================================
// 免扫码恢复与唤醒登录
// ============================================================================

#[tokio::test]
async fn failed_awaken_falls_back_to_qr() {
    let dir = tempfile::tempdir().unwrap();
    write_previous(dir.path(), "wxid_old").await;
    let gw = FakeGateway::new();
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;

    let state = m.begin_login(SystemMode::Normal).await.unwrap();
    assert_eq!(polling(&state).0, "uuid-1");
    assert!(!state.attempt().unwrap().qr_url.is_empty());
    assert_eq!(state.attempt().unwrap().device_id, "49deadbeef");

    let calls = gw.calls();
    let awaken = calls.iter().position(|c| *c == "awaken").unwrap();
    let qr = calls.iter().position(|c| *c == "qr").unwrap();
    assert!(awaken < qr);
}

#[tokio::test]
async fn awaken_success_skips_the_qr_code() {
    let dir = tempfile::tempdir().unwrap();
    write_previous(dir.path(), "wxid_old").await;
    let gw = FakeGateway::new();
    gw.set_awaken(Ok("wake-1".into()));
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;

    let state = m.begin_login(SystemMode::Normal).await.unwrap();
    assert_eq!(polling(&state), ("wake-1".to_string(), 0));
    assert_eq!(gw.count("qr"), 0);
}

#[tokio::test]
async fn live_gateway_session_resumes_without_scan() {
    let dir = tempfile::tempdir().unwrap();
    write_previous(dir.path(), "wxid_old").await;
    let gw = FakeGateway::new();
    gw.set_cached(serde_json::json!({ "Wxid": "wxid_old" }));
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;

    let state = m.begin_login(SystemMode::Normal).await.unwrap();
    let LoginState::LoggedIn(session) = state else {
        panic!("expected resumed session");
    };
    assert_eq!(session.wxid, "wxid_old");
    assert!(session.online);
    assert_eq!(gw.count("qr"), 0);
    assert_eq!(gw.count("awaken"), 0);
    m.shutdown().await;
}

#[tokio::test]
async fn corrupt_record_starts_a_fresh_login() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("robot_stat.json"), "{ not json").unwrap();
    let gw = FakeGateway::new();
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;

    let state = m.begin_login(SystemMode::Normal).await.unwrap();
    assert_eq!(polling(&state).0, "uuid-1");
    assert_eq!(gw.count("awaken"), 0);
    assert!(m.session().await.has_device());
}

// ============================================================================
// 最小模式
// ============================================================================

#[tokio::test]
async fn degraded_mode_makes_no_gateway_calls() {
    let dir = tempfile::tempdir().unwrap();
    write_previous(dir.path(), "wxid_old").await;
    let gw = FakeGateway::new();
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;

    assert_eq!(
        m.begin_login(SystemMode::Degraded).await.unwrap(),
        LoginState::Unavailable
    );
    assert_eq!(m.poll_once().await.unwrap(), LoginState::Unavailable);
    m.logout().await.unwrap();
    assert!(gw.calls().is_empty());
}

#[tokio::test]
async fn degraded_login_leaves_an_active_session_alone() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = logged_in(&gw, dir.path(), fast_policy()).await;

    let state = m.begin_login(SystemMode::Degraded).await.unwrap();
    assert!(state.is_logged_in());
    assert!(m.state().is_logged_in());
    assert_eq!(m.session().await.wxid, "wxid_bot");
    assert!(m.heartbeat_running());
    m.shutdown().await;
}

// ============================================================================
// 心跳、登出与关闭
// ============================================================================

#[tokio::test]
async fn repeated_heartbeat_failures_log_out() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    for _ in 0..3 {
        gw.push_heartbeat(Err(GatewayError::unreachable("/HeartBeat", "timeout")));
    }
    let m = logged_in(&gw, dir.path(), fast_policy()).await;
    let mut rx = m.subscribe();

    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| *s == LoginState::LoggedOut),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(gw.count("heartbeat"), 3);
    let saved = store(dir.path()).load().await;
    assert!(saved.wxid.is_empty());
    assert!(saved.has_device());
}

#[tokio::test]
async fn a_successful_heartbeat_resets_the_failure_count() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    gw.push_heartbeat(Err(GatewayError::unreachable("/HeartBeat", "timeout")));
    gw.push_heartbeat(Err(GatewayError::unreachable("/HeartBeat", "timeout")));
    gw.push_heartbeat(Ok(true));
    gw.push_heartbeat(Err(GatewayError::unreachable("/HeartBeat", "timeout")));
    gw.push_heartbeat(Err(GatewayError::unreachable("/HeartBeat", "timeout")));
    let m = logged_in(&gw, dir.path(), fast_policy()).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while gw.count("heartbeat") < 6 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(m.state().is_logged_in());
    m.shutdown().await;
}

#[tokio::test]
async fn logout_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = logged_in(&gw, dir.path(), fast_policy()).await;

    m.logout().await.unwrap();
    assert_eq!(m.state(), LoginState::LoggedOut);
    assert!(!m.heartbeat_running());
    m.logout().await.unwrap();
    assert_eq!(m.state(), LoginState::LoggedOut);
    assert_eq!(gw.count("logout"), 1);

    let saved = store(dir.path()).load().await;
    assert!(saved.wxid.is_empty());
    assert!(saved.has_device());
}

#[tokio::test]
async fn no_heartbeats_are_sent_after_logout() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = logged_in(&gw, dir.path(), fast_policy()).await;
    m.logout().await.unwrap();

    let sent = gw.count("heartbeat");
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(gw.count("heartbeat"), sent);
    assert!(!m.heartbeat_running());
}

#[tokio::test]
async fn logout_cancels_a_pending_login() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;
    m.begin_login(SystemMode::Normal).await.unwrap();

    m.logout().await.unwrap();
    assert_eq!(m.state(), LoginState::LoggedOut);
    assert!(m.qr_code().is_none());
    assert_eq!(gw.count("logout"), 0);
}

#[tokio::test]
async fn shutdown_marks_the_session_offline() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = logged_in(&gw, dir.path(), fast_policy()).await;

    m.shutdown().await;
    assert!(!m.heartbeat_running());
    assert_eq!(gw.count("stop_auto_heartbeat"), 1);

    let saved = store(dir.path()).load().await;
    assert_eq!(saved.wxid, "wxid_bot");
    assert!(!saved.online);
}

#[tokio::test]
async fn shutdown_survives_an_unwritable_store() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    let m = logged_in(&gw, dir.path(), fast_policy()).await;

    // 让会话文件路径变成目录，写入必然失败
    let path = dir.path().join("robot_stat.json");
    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir_all(path.join("blocker")).unwrap();

    m.shutdown().await;
    assert!(!m.heartbeat_running());
}

#[tokio::test]
async fn explicit_login_follows_a_logout() {
    let dir = tempfile::tempdir().unwrap();
    let gw = FakeGateway::new();
    gw.push_qr(Ok(QrCode {
        uuid: "first".into(),
        url: "http://qr.test/first".into(),
    }));
    let m = machine(&gw, dir.path(), RetryPolicy::default()).await;
    assert_eq!(polling(&m.begin_login(SystemMode::Normal).await.unwrap()).0, "first");

    m.logout().await.unwrap();
    let state = m.begin_login(SystemMode::Normal).await.unwrap();
    assert_eq!(polling(&state).0, "uuid-1");
}

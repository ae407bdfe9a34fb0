use anyhow::Result;
use futures::StreamExt;
use std::time::Duration;
use tempfile::TempDir;
use uptime_monitor::{create_error_response, Config, MonitorError, ProbeStatus, UptimeMonitor};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.storage.path = dir.path().join("users.db");
    config.storage.save_retries = 0;
    config.auth.bcrypt_cost = 4;
    config.auth.session_secret = "integration-secret".to_string();
    config.prober.timeout_secs = 1;
    config
}

async fn mock_site() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/up"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/down"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_state_survives_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let server = mock_site().await;
    let up = format!("{}/up", server.uri());
    let down = format!("{}/down", server.uri());

    let monitor = UptimeMonitor::open(test_config(&dir)).await?;
    monitor.signup("alice", "secret", "secret").await?;
    let token = monitor.login("alice", "secret").await?;

    monitor.add_target(&token, "Up", &up, 30).await?;
    monitor.add_target(&token, "Down", &down, 60).await?;
    monitor.toggle_pause(&token, &down).await?;

    let snapshot = monitor.snapshot(&token).await?;
    assert_eq!(snapshot.status[&up].last_status, Some(ProbeStatus::Up));
    assert_eq!(snapshot.status[&down].last_status, Some(ProbeStatus::Down));
    assert_eq!(snapshot.status[&down].history[0].http_status, Some(503));
    monitor.shutdown().await;

    let reopened = UptimeMonitor::open(test_config(&dir)).await?;
    let token = reopened.login("alice", "secret").await?;
    let snapshot = reopened.snapshot(&token).await?;

    let urls: Vec<&str> = snapshot.targets.iter().map(|t| t.url.as_str()).collect();
    assert_eq!(urls, vec![up.as_str(), down.as_str()]);
    assert!(snapshot.targets[1].paused);
    assert_eq!(snapshot.status[&up].total_checks, 1);
    assert_eq!(snapshot.status[&up].uptime_percent, 100.0);
    assert_eq!(snapshot.status[&down].uptime_percent, 0.0);

    reopened.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_timeouts_count_as_down() -> Result<()> {
    let dir = TempDir::new()?;
    let server = mock_site().await;
    let slow = format!("{}/slow", server.uri());

    let monitor = UptimeMonitor::open(test_config(&dir)).await?;
    monitor.signup("alice", "pw", "pw").await?;
    let token = monitor.login("alice", "pw").await?;

    monitor.add_target(&token, "Slow", &slow, 30).await?;
    let record = monitor.check_now(&token, &slow).await?;
    assert_eq!(record.total_checks, 2);
    assert_eq!(record.down_count, 2);
    assert_eq!(record.last_response_time, 0.0);
    assert_eq!(record.avg_response_time, 0.0);
    assert!(record.history[1].error.as_deref().unwrap().contains("timed out"));

    monitor.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_owners_are_isolated() -> Result<()> {
    let dir = TempDir::new()?;
    let server = mock_site().await;
    let up = format!("{}/up", server.uri());

    let monitor = UptimeMonitor::open(test_config(&dir)).await?;
    monitor.signup("alice", "a", "a").await?;
    monitor.signup("bob", "b", "b").await?;
    let alice = monitor.login("alice", "a").await?;
    let bob = monitor.login("bob", "b").await?;

    monitor.add_target(&alice, "Mine", &up, 30).await?;
    monitor.add_target(&bob, "Also mine", &up, 30).await?;
    monitor.remove_target(&bob, &up).await?;

    let alice_view = monitor.snapshot(&alice).await?;
    assert_eq!(alice_view.targets.len(), 1);
    assert_eq!(alice_view.status[&up].total_checks, 1);

    let bob_view = monitor.snapshot(&bob).await?;
    assert!(bob_view.targets.is_empty());
    assert!(bob_view.status.is_empty());

    monitor.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_rejections_leave_state_unchanged() -> Result<()> {
    let dir = TempDir::new()?;
    let server = mock_site().await;
    let up = format!("{}/up", server.uri());

    let monitor = UptimeMonitor::open(test_config(&dir)).await?;
    monitor.signup("alice", "pw", "pw").await?;
    let token = monitor.login("alice", "pw").await?;
    monitor.add_target(&token, "Up", &up, 30).await?;

    let duplicate = monitor.add_target(&token, "Again", &up, 90).await.unwrap_err();
    let body = create_error_response(&duplicate);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["status"], 409);

    let too_fast = monitor
        .add_target(&token, "Fast", "http://fast.test", 5)
        .await
        .unwrap_err();
    assert!(matches!(too_fast, MonitorError::InvalidInput(_)));

    let missing = monitor
        .toggle_pause(&token, "http://missing.test")
        .await
        .unwrap_err();
    assert_eq!(create_error_response(&missing)["error"]["kind"], "not_found");

    let bad_login = monitor.login("alice", "nope").await.unwrap_err();
    assert_eq!(bad_login.status_code(), 401);

    let targets = monitor.list_targets(&token).await?;
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].name, "Up");
    assert_eq!(targets[0].interval, 30);

    monitor.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_subscription_ends_on_shutdown() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    config.subscriptions.cadence_secs = 1;

    let monitor = UptimeMonitor::open(config).await?;
    monitor.signup("alice", "pw", "pw").await?;
    let token = monitor.login("alice", "pw").await?;

    let mut updates = monitor.subscribe(&token).await?;
    monitor.start().await;

    let first = updates.next().await.expect("initial snapshot");
    assert_eq!(first.owner_id, "alice");
    let second = tokio::time::timeout(Duration::from_secs(5), updates.next()).await?;
    assert!(second.is_some());

    monitor.shutdown().await;
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while updates.next().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok());
    Ok(())
}

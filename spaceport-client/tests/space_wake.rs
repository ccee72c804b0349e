//! Integration tests for hub-hosted spaces: host lookup, wake-up polling,
//! JWT signing and unavailable spaces.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use common::{app_config, spawn};
use pretty_assertions::assert_eq;
use spaceport_client::{Client, ClientOptions};
use spaceport_core::{
    ClientConfig, LoadStatus, PayloadValue, ResolveError, SpaceState, SpaceStatus, SpaceportError,
};

fn settings(hub_url: String) -> ClientConfig {
    ClientConfig {
        hub_url,
        wake_poll_interval_ms: 10,
        ..ClientConfig::default()
    }
}

fn recorder() -> (Arc<Mutex<Vec<SpaceStatus>>>, impl Fn(&SpaceStatus) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |status: &SpaceStatus| {
        sink.lock().unwrap().push(status.clone())
    })
}

#[tokio::test]
async fn test_sleeping_space_wakes_up() {
    let app = spawn(app_config(false, &[("predict", None)])).await;
    app.sleep_until_running(&["SLEEPING", "BUILDING", "BUILDING", "RUNNING"]);
    let (seen, callback) = recorder();

    let client = Client::connect(
        "owner/app",
        ClientOptions::default()
            .with_settings(settings(app.url()))
            .with_status_callback(callback),
    )
    .await
    .unwrap();

    assert_eq!(client.config().root, app.url());
    assert_eq!(client.endpoint_info().space_id.as_deref(), Some("owner/app"));
    assert_eq!(client.endpoint_info().ws_protocol, "ws");

    let seen = seen.lock().unwrap();
    let states: Vec<(SpaceState, LoadStatus)> =
        seen.iter().map(|s| (s.status, s.load_status)).collect();
    assert_eq!(
        states,
        vec![
            (SpaceState::Sleeping, LoadStatus::Pending),
            (SpaceState::Building, LoadStatus::Pending),
            (SpaceState::Building, LoadStatus::Pending),
            (SpaceState::Running, LoadStatus::Complete),
        ]
    );
    assert_eq!(seen[0].message, "Space is asleep. Waking it up...");
    assert_eq!(seen[0].detail, "SLEEPING");
    assert_eq!(seen[1].message, "Space is building...");
    assert_eq!(seen[3].message, "");
    assert_eq!(seen[3].detail, "RUNNING");
    assert_eq!(app.state.status_polls.load(Ordering::SeqCst), 4);
    assert_eq!(app.state.config_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_running_space_needs_no_polling() {
    let app = spawn(app_config(false, &[("predict", None)])).await;
    let (seen, callback) = recorder();

    Client::connect(
        "owner/app",
        ClientOptions::default()
            .with_settings(settings(app.url()))
            .with_status_callback(callback),
    )
    .await
    .unwrap();

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(app.state.status_polls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_private_space_signs_queue_socket() {
    let app = spawn(app_config(true, &[("predict", None)])).await;
    let client = Client::connect(
        "owner/app",
        ClientOptions::default()
            .with_settings(settings(app.url()))
            .with_token("hf_secret"),
    )
    .await
    .unwrap();

    client
        .predict("/predict", vec![PayloadValue::from("x")])
        .await
        .unwrap();
    assert_eq!(
        app.state.queue_signs.lock().unwrap()[0].as_deref(),
        Some("signed-jwt")
    );
}

#[tokio::test]
async fn test_broken_space_is_reported() {
    let app = spawn(app_config(false, &[("predict", None)])).await;
    app.sleep_until_running(&["RUNTIME_ERROR"]);
    app.state.discussions_disabled.store(true, Ordering::SeqCst);
    let (seen, callback) = recorder();

    let err = Client::connect(
        "owner/app",
        ClientOptions::default()
            .with_settings(settings(app.url()))
            .with_status_callback(callback),
    )
    .await
    .unwrap_err();

    match err {
        SpaceportError::Resolve(ResolveError::SpaceUnavailable { stage }) => {
            assert_eq!(stage, "RUNTIME_ERROR")
        }
        other => panic!("expected unavailable space, got {other:?}"),
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status, SpaceState::SpaceError);
    assert_eq!(seen[0].load_status, LoadStatus::Error);
    assert_eq!(seen[0].message, "This space is experiencing an issue.");
    assert_eq!(seen[0].discussions_enabled, Some(false));
}

#[tokio::test]
async fn test_plain_url_failure_is_not_polled() {
    let app = spawn(app_config(false, &[("predict", None)])).await;
    app.sleep_until_running(&["SLEEPING"]);
    let (seen, callback) = recorder();

    let err = Client::connect(
        &app.url(),
        ClientOptions::default()
            .with_settings(settings(app.url()))
            .with_status_callback(callback),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        SpaceportError::Resolve(ResolveError::ConfigUnavailable { .. })
    ));
    assert_eq!(app.state.status_polls.load(Ordering::SeqCst), 0);
    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].message, "Could not load this space.");
    assert_eq!(seen[0].detail, "NOT_FOUND");
}

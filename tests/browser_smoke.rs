//! Live-browser smoke tests for the real provisioner.
//!
//! These tests require Chrome to be installed and available.
//! Run with: cargo test --test browser_smoke -- --ignored

use errand::config::{Config, EngineKind};
use errand::model::AgentAction;
use errand::session::{EokaProvisioner, Provisioner, Vehicle};

/// Check if Chrome is available
fn chrome_available() -> bool {
    eoka::stealth::patcher::find_chrome().is_ok()
}

fn test_config(tmp: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.video.frames_root = tmp.path().join("runs");
    config.video.artifacts_dir = tmp.path().join("videos");
    config
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn acquire_navigate_observe_close() {
    if !chrome_available() {
        eprintln!("Chrome not found, skipping test");
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let provisioner = EokaProvisioner::new(&test_config(&tmp)).unwrap();

    let mut vehicle = provisioner
        .acquire("smoke001", EngineKind::Standard)
        .await
        .expect("Failed to acquire session");

    let detail = vehicle
        .apply(&AgentAction::Navigate {
            url: r#"data:text/html,<title>Smoke</title><button id="go">Go</button>"#.into(),
        })
        .await
        .expect("Failed to navigate");
    assert!(detail.starts_with("at "));

    let view = vehicle.view().await.expect("Failed to observe");
    assert_eq!(view.title, "Smoke");
    assert_eq!(view.elements.len(), 1);
    assert!(view.element_list().contains("Go"));

    let sink = vehicle.close().await;
    // frame zero plus one per applied action
    assert!(sink.frame_count() >= 1);
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn extract_reads_page_title() {
    if !chrome_available() {
        eprintln!("Chrome not found, skipping test");
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let provisioner = EokaProvisioner::new(&test_config(&tmp)).unwrap();

    let mut vehicle = provisioner
        .acquire("smoke002", EngineKind::Stealth)
        .await
        .expect("Failed to acquire stealth session");

    vehicle
        .apply(&AgentAction::Navigate {
            url: r#"data:text/html,<title>Example Domain</title><p>hello</p>"#.into(),
        })
        .await
        .expect("Failed to navigate");

    let detail = vehicle
        .apply(&AgentAction::Extract {
            js: "document.title".into(),
        })
        .await
        .expect("Failed to extract");
    assert_eq!(detail, "Example Domain");

    let _sink = vehicle.close().await;
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn click_miss_is_recorded_not_fatal() {
    if !chrome_available() {
        eprintln!("Chrome not found, skipping test");
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let provisioner = EokaProvisioner::new(&test_config(&tmp)).unwrap();

    let mut vehicle = provisioner
        .acquire("smoke003", EngineKind::Standard)
        .await
        .expect("Failed to acquire session");

    // no observation yet, so any index is out of range
    let result = vehicle.apply(&AgentAction::Click { index: 0 }).await;
    match result {
        Err(errand::Error::Action(msg)) => assert!(msg.contains("element [0]")),
        other => panic!("expected an action-level failure, got {:?}", other.map(|_| ())),
    }

    let _sink = vehicle.close().await;
}

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

use ln_sol_swap::autopost::{
    AutopostManager, AutopostTool, ListingPublisher, StartParams,
};
use ln_sol_swap::clock::now_unix;
use support::wait_for;

#[derive(Default)]
struct RecordingPublisher {
    calls: Mutex<Vec<(AutopostTool, Value)>>,
}

impl RecordingPublisher {
    fn calls(&self) -> Vec<(AutopostTool, Value)> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }
}

#[async_trait]
impl ListingPublisher for RecordingPublisher {
    async fn publish(&self, tool: AutopostTool, args: &Value) -> Result<Value> {
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .push((tool, args.clone()));
        Ok(json!({"ok": true}))
    }
}

fn start_params(name: &str, interval_sec: u64, ttl_sec: u64) -> StartParams {
    StartParams {
        name: name.to_string(),
        tool: AutopostTool::PublishOffer,
        interval_sec,
        ttl_sec,
        valid_until_unix: None,
        args: json!({"channel": "rfq.btc-usdt", "ttl_sec": 999}),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn start_rejects_bad_bounds_and_duplicate_names() {
    let publisher = Arc::new(RecordingPublisher::default());
    let manager = AutopostManager::new(publisher);

    let err = manager.start(start_params("short-ttl", 1, 9)).unwrap_err();
    assert!(err.to_string().contains("ttl_sec"));

    let err = manager
        .start(StartParams {
            valid_until_unix: Some(now_unix().saturating_sub(100)),
            ..start_params("past-expiry", 1, 60)
        })
        .unwrap_err();
    assert!(err.to_string().contains("past"));

    let err = manager
        .start(StartParams {
            valid_until_unix: Some(now_unix() + 5),
            ..start_params("short-horizon", 1, 60)
        })
        .unwrap_err();
    assert!(err.to_string().contains("horizon"));

    manager.start(start_params("dup", 1, 60)).expect("first start");
    let err = manager.start(start_params("dup", 1, 60)).unwrap_err();
    assert!(err.to_string().contains("already in use"));

    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn first_run_is_immediate_and_args_are_rewritten() {
    let publisher = Arc::new(RecordingPublisher::default());
    let manager = AutopostManager::new(publisher.clone());

    let status = manager
        .start(start_params("immediate", 3600, 120))
        .expect("start");

    wait_for("first autopost run", Duration::from_secs(5), || {
        let publisher = publisher.clone();
        async move { Ok((!publisher.calls().is_empty()).then_some(())) }
    })
    .await
    .expect("first run happened");

    let calls = publisher.calls();
    assert_eq!(calls.len(), 1);
    let (tool, args) = &calls[0];
    assert_eq!(*tool, AutopostTool::PublishOffer);
    // The frozen ttl hint is stripped and the fixed expiry pinned.
    assert!(args.get("ttl_sec").is_none());
    assert_eq!(args["valid_until_unix"], status.valid_until_unix);

    let snapshot = manager.status(Some("immediate"));
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].runs, 1);
    assert_eq!(snapshot[0].last_ok, Some(true));

    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn job_never_extends_validity_and_self_destructs() {
    let publisher = Arc::new(RecordingPublisher::default());
    let manager = AutopostManager::new(publisher.clone());

    let fixed_expiry = now_unix() + 10;
    manager
        .start(StartParams {
            valid_until_unix: Some(fixed_expiry),
            ..start_params("rolling", 1, 10)
        })
        .expect("start");

    tokio::time::sleep(Duration::from_millis(11_500)).await;

    // The job removed itself at the horizon.
    assert!(manager.status(Some("rolling")).is_empty());

    let calls = publisher.calls();
    assert!(
        (9..=12).contains(&calls.len()),
        "expected roughly one publish per second, got {}",
        calls.len()
    );
    for (_, args) in &calls {
        assert_eq!(args["valid_until_unix"], fixed_expiry);
    }

    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_idempotent_and_status_sorts_newest_first() {
    let publisher = Arc::new(RecordingPublisher::default());
    let manager = AutopostManager::new(publisher);

    manager.start(start_params("older", 3600, 120)).expect("start older");
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.start(start_params("newer", 3600, 120)).expect("start newer");

    let statuses = manager.status(None);
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].name, "newer");
    assert_eq!(statuses[1].name, "older");

    let stopped = manager.stop("older");
    assert!(stopped.stopped);
    let again = manager.stop("older");
    assert!(!again.stopped);
    assert_eq!(again.reason, Some("not_found"));

    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_first_run_keeps_the_job_alive() {
    struct FlakyPublisher {
        calls: Mutex<u64>,
    }

    #[async_trait]
    impl ListingPublisher for FlakyPublisher {
        async fn publish(&self, _tool: AutopostTool, _args: &Value) -> Result<Value> {
            let mut calls = self.calls.lock().expect("calls mutex poisoned");
            *calls += 1;
            if *calls == 1 {
                anyhow::bail!("bus unreachable");
            }
            Ok(json!({"ok": true}))
        }
    }

    let publisher = Arc::new(FlakyPublisher {
        calls: Mutex::new(0),
    });
    let manager = AutopostManager::new(publisher.clone());
    manager.start(start_params("flaky", 1, 60)).expect("start");

    let status = wait_for("recovered run", Duration::from_secs(5), || {
        let manager = manager.clone();
        async move {
            Ok(manager
                .status(Some("flaky"))
                .pop()
                .filter(|s| s.runs >= 2 && s.last_ok == Some(true)))
        }
    })
    .await
    .expect("job recovered");
    assert!(status.last_error.is_none());

    manager.shutdown();
}

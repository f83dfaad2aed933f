use super::*;
use crate::test_support::FakeProvider;
use rstest::rstest;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

const FAST: Duration = Duration::from_millis(5);

fn monitor(provider: &FakeProvider, request_id: &str) -> InterruptionMonitor<FakeProvider> {
    InterruptionMonitor::new(Arc::new(provider.clone()), request_id, "box").with_poll_interval(FAST)
}

#[rstest]
#[case(SpotStatus::MarkedForTermination, MonitorState::Triggered)]
#[case(SpotStatus::Fulfilled, MonitorState::Watching)]
#[case(SpotStatus::TerminatedByUser, MonitorState::Watching)]
#[case(SpotStatus::NotFound, MonitorState::Gone)]
#[case(SpotStatus::PendingFulfillment, MonitorState::Gone)]
#[case(SpotStatus::Other(String::from("capacity-oversubscribed")), MonitorState::Gone)]
fn transitions_from_watching(#[case] status: SpotStatus, #[case] expected: MonitorState) {
    assert_eq!(MonitorState::on_status(&status), expected);
}

#[tokio::test]
async fn callback_runs_once_after_third_poll() {
    let provider = FakeProvider::new();
    provider.seed_spot_request(
        "sir-1",
        [
            SpotStatus::Fulfilled,
            SpotStatus::Fulfilled,
            SpotStatus::MarkedForTermination,
        ],
    );
    let calls = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let handle = monitor(&provider, "sir-1").spawn({
        let calls = Arc::clone(&calls);
        let seen = Arc::clone(&seen);
        let observer = provider.clone();
        move |name: String| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            seen.lock()
                .expect("observer lock")
                .push((name, observer.spot_polls()));
            Ok::<(), String>(())
        }
    });

    assert_eq!(handle.join().await, MonitorExit::Done);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        seen.lock().expect("observer lock").as_slice(),
        &[(String::from("box"), 3)]
    );
    assert_eq!(provider.spot_polls(), 3);
}

#[tokio::test]
async fn missing_request_ends_without_callback() {
    let provider = FakeProvider::new();
    provider.seed_spot_request("sir-2", [SpotStatus::Fulfilled, SpotStatus::TerminatedByUser]);
    let calls = Arc::new(AtomicU32::new(0));

    let handle = monitor(&provider, "sir-2").spawn({
        let calls = Arc::clone(&calls);
        move |_name: String| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), String>(())
        }
    });

    let token = handle.cancellation_token();
    let exit = handle.join().await;
    assert!(matches!(exit, MonitorExit::Gone { .. }), "unexpected exit {exit:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(provider.spot_polls(), 3);
    assert!(token.is_cancelled(), "a finished monitor marks its token");
}

#[tokio::test]
async fn shutdown_cancels_a_watching_monitor() {
    let provider = FakeProvider::new();
    provider.seed_spot_request("sir-3", [SpotStatus::Fulfilled]);
    provider.set_spot_status("sir-3", SpotStatus::Fulfilled);

    let handle = monitor(&provider, "sir-3").spawn(|_name: String| async { Ok::<(), String>(()) });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!handle.is_finished());

    assert_eq!(handle.shutdown().await, MonitorExit::Cancelled);
    assert!(provider.spot_polls() >= 1);
}

#[tokio::test]
async fn transient_read_failures_keep_watching() {
    let provider = FakeProvider::new();
    provider.seed_spot_request("sir-4", [SpotStatus::MarkedForTermination]);
    provider.fail_spot_reads(2);

    let handle = monitor(&provider, "sir-4")
        .with_max_read_failures(3)
        .spawn(|_name: String| async { Ok::<(), String>(()) });

    assert_eq!(handle.join().await, MonitorExit::Done);
    assert_eq!(provider.spot_polls(), 3);
}

#[tokio::test]
async fn persistent_read_failures_end_the_watch() {
    let provider = FakeProvider::new();
    provider.seed_spot_request("sir-5", [SpotStatus::MarkedForTermination]);
    provider.fail_spot_reads(100);

    let handle = monitor(&provider, "sir-5")
        .with_max_read_failures(2)
        .spawn(|_name: String| async { Ok::<(), String>(()) });

    let exit = handle.join().await;
    assert!(matches!(exit, MonitorExit::Gone { .. }), "unexpected exit {exit:?}");
    assert_eq!(provider.spot_polls(), 3);
}

#[tokio::test]
async fn callback_failure_is_reported_not_raised() {
    let provider = FakeProvider::new();
    provider.seed_spot_request("sir-6", [SpotStatus::MarkedForTermination]);

    let handle = monitor(&provider, "sir-6")
        .spawn(|_name: String| async { Err::<(), String>(String::from("snapshot failed")) });

    assert_eq!(
        handle.join().await,
        MonitorExit::CallbackFailed {
            message: String::from("snapshot failed")
        }
    );
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use collateral_realtime::{RefreshTrigger, RefreshTriggerConfig};
use tokio::sync::Semaphore;
use tokio::time::sleep;

fn counting_trigger(debounce: Duration) -> (RefreshTrigger, Arc<AtomicUsize>) {
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refreshes);
    let trigger = RefreshTrigger::new(RefreshTriggerConfig { debounce }, move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    (trigger, refreshes)
}

#[tokio::test(flavor = "current_thread")]
async fn a_notification_burst_collapses_to_one_refresh() {
    let (trigger, refreshes) = counting_trigger(Duration::from_millis(100));

    for _ in 0..50 {
        trigger.notify();
    }
    trigger.wait_idle().await;

    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(trigger.refresh_count(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn a_quiet_period_separates_two_refreshes() {
    let (trigger, refreshes) = counting_trigger(Duration::from_millis(20));

    trigger.notify();
    trigger.wait_idle().await;
    trigger.notify();
    trigger.wait_idle().await;

    assert_eq!(refreshes.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn dispose_cancels_a_pending_refresh() {
    let (trigger, refreshes) = counting_trigger(Duration::from_millis(50));

    trigger.notify();
    trigger.dispose();

    sleep(Duration::from_millis(150)).await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    assert_eq!(trigger.refresh_count(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn dropping_the_trigger_cancels_pending_work() {
    let (trigger, refreshes) = counting_trigger(Duration::from_millis(50));

    trigger.notify();
    drop(trigger);

    sleep(Duration::from_millis(150)).await;
    assert_eq!(refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn notifications_during_a_refresh_queue_exactly_one_follow_up() {
    let gate = Arc::new(Semaphore::new(0));
    let refreshes = Arc::new(AtomicUsize::new(0));

    let trigger = RefreshTrigger::new(
        RefreshTriggerConfig {
            debounce: Duration::from_millis(10),
        },
        {
            let gate = Arc::clone(&gate);
            let counter = Arc::clone(&refreshes);
            move || {
                let gate = Arc::clone(&gate);
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let permit = gate.acquire().await.expect("gate closed");
                    permit.forget();
                }
            }
        },
    );

    trigger.notify();
    sleep(Duration::from_millis(50)).await; // first refresh is now running
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);

    // A burst while the refresh runs coalesces into a single follow-up.
    trigger.notify();
    trigger.notify();
    trigger.notify();

    gate.add_permits(2);
    trigger.wait_idle().await;

    assert_eq!(refreshes.load(Ordering::SeqCst), 2);
    assert_eq!(trigger.refresh_count(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn the_default_quiet_period_is_conservative() {
    let config = RefreshTriggerConfig::default();
    assert_eq!(config.debounce, Duration::from_millis(250));
}

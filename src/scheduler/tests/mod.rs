use super::*;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};


fn wifi() -> DeviceConditions {
    DeviceConditions::default()
}

fn mobile_data() -> DeviceConditions {
    DeviceConditions {
        network: NetworkState {
            connected: true,
            metered: true,
        },
        ..Default::default()
    }
}

fn offline() -> DeviceConditions {
    DeviceConditions {
        network: NetworkState {
            connected: false,
            metered: false,
        },
        ..Default::default()
    }
}

#[test]
fn test_network_constraints() {
    let unmetered = JobConstraints {
        network_type: NetworkType::Unmetered,
        ..Default::default()
    };
    assert!(unmetered.violation(&wifi()).is_none());
    assert!(unmetered.violation(&mobile_data()).is_some());
    assert!(unmetered.violation(&offline()).is_some());

    let connected = JobConstraints {
        network_type: NetworkType::Connected,
        ..Default::default()
    };
    assert!(connected.violation(&mobile_data()).is_none());
    assert!(connected.violation(&offline()).is_some());

    let none = JobConstraints::default();
    assert!(none.violation(&offline()).is_none());
}

#[test]
fn test_battery_and_storage_constraints() {
    let constraints = JobConstraints {
        network_type: NetworkType::None,
        battery_not_low: true,
        storage_not_low: true,
    };
    let low_battery = DeviceConditions {
        battery_low: true,
        ..Default::default()
    };
    let low_storage = DeviceConditions {
        storage_low: true,
        ..Default::default()
    };

    assert_eq!(
        constraints.violation(&low_battery).as_deref(),
        Some("battery is low")
    );
    assert_eq!(
        constraints.violation(&low_storage).as_deref(),
        Some("storage is low")
    );
    assert!(JobConstraints::default().violation(&low_battery).is_none());
}

#[test]
fn test_backoff_delays() {
    let exponential = BackoffCriteria::exponential(Duration::from_secs(30));
    assert_eq!(exponential.delay(1), Duration::from_secs(30));
    assert_eq!(exponential.delay(2), Duration::from_secs(60));
    assert_eq!(exponential.delay(4), Duration::from_secs(240));
    assert_eq!(exponential.delay(40), MAX_BACKOFF_DELAY);

    let linear = BackoffCriteria {
        policy: BackoffPolicy::Linear,
        initial_delay: Duration::from_secs(30),
    };
    assert_eq!(linear.delay(1), Duration::from_secs(30));
    assert_eq!(linear.delay(3), Duration::from_secs(90));
}

/// Handler that replays scripted outcomes, then succeeds
struct ScriptedHandler {
    runs: AtomicUsize,
    active: AtomicBool,
    overlapped: AtomicBool,
    cancelled_seen: AtomicBool,
    hold: Duration,
    outcomes: tokio::sync::Mutex<VecDeque<JobOutcome>>,
}

impl ScriptedHandler {
    fn new(outcomes: &[JobOutcome]) -> Arc<Self> {
        Self::holding(outcomes, Duration::ZERO)
    }

    /// Each run lasts `hold` unless cancelled
    fn holding(outcomes: &[JobOutcome], hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            cancelled_seen: AtomicBool::new(false),
            hold,
            outcomes: tokio::sync::Mutex::new(outcomes.iter().copied().collect()),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn run(&self, cancel: CancellationToken) -> JobOutcome {
        if self.active.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.runs.fetch_add(1, Ordering::SeqCst);

        if !self.hold.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => self.cancelled_seen.store(true, Ordering::SeqCst),
                _ = tokio::time::sleep(self.hold) => {}
            }
        }

        self.active.store(false, Ordering::SeqCst);
        self.outcomes
            .lock()
            .await
            .pop_front()
            .unwrap_or(JobOutcome::Success)
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_running_stream_starts_with_current_state() {
    let scheduler = TokioJobScheduler::new(wifi());
    let mut stream = scheduler.running_stream("job").await;
    assert_eq!(stream.next().await, Some(false));
    assert!(!scheduler.is_running("job").await);
}

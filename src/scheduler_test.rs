//! # Scheduler Test Suite
//!
//! Covers task bookkeeping, the completion callback and the fail-fast
//! cancellation path of [`TrackingScheduler`].

use crate::error::{FailureCause, OpletError};
use crate::scheduler::{CancelReport, TaskState, TrackingScheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;

type Completions = Arc<Mutex<Vec<Option<String>>>>;

fn recording_scheduler() -> (TrackingScheduler, Completions) {
  let completions: Completions = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&completions);
  let scheduler = TrackingScheduler::new("test", Handle::current(), move |failure| {
    sink
      .lock()
      .unwrap()
      .push(failure.map(|f| f.to_string()));
  });
  (scheduler, completions)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
  for _ in 0..200 {
    if condition() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_one_shot_completion_reports_no_error() {
  let (scheduler, completions) = recording_scheduler();
  let handle = scheduler.submit("work", async { Ok(()) });

  wait_for(|| !completions.lock().unwrap().is_empty()).await;
  assert_eq!(*completions.lock().unwrap(), vec![None]);
  assert_eq!(handle.state(), TaskState::Done);
  assert!(!scheduler.has_active_tasks());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_completion_waits_for_scheduled_work() {
  let (scheduler, completions) = recording_scheduler();
  scheduler.schedule("later", Duration::from_millis(100), async { Ok(()) });
  scheduler.submit("now", async { Ok(()) });

  tokio::time::sleep(Duration::from_millis(30)).await;
  assert!(completions.lock().unwrap().is_empty());
  assert!(scheduler.has_active_tasks());

  wait_for(|| !completions.lock().unwrap().is_empty()).await;
  assert_eq!(*completions.lock().unwrap(), vec![None]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failure_cancels_everything_and_reports_once() {
  let (scheduler, completions) = recording_scheduler();
  let ticks = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&ticks);
  let poller = scheduler.schedule_periodic(
    "poll",
    Duration::ZERO,
    Duration::from_millis(5),
    move || {
      let counter = Arc::clone(&counter);
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    },
  );
  let pending = scheduler.schedule("pending", Duration::from_secs(60), async { Ok(()) });
  scheduler.schedule("broken", Duration::from_millis(30), async {
    Err(OpletError::Closed("sensor".to_string()))
  });
  scheduler.schedule("also broken", Duration::from_millis(30), async {
    Err(OpletError::Closed("sensor".to_string()))
  });

  wait_for(|| !completions.lock().unwrap().is_empty()).await;
  tokio::time::sleep(Duration::from_millis(50)).await;

  let completions = completions.lock().unwrap().clone();
  assert_eq!(completions.len(), 1);
  assert!(completions[0].as_deref().unwrap().contains("'sensor' was closed"));
  assert!(scheduler.has_failed());
  assert!(!scheduler.has_active_tasks());
  assert_eq!(poller.state(), TaskState::Cancelled);
  assert_eq!(pending.state(), TaskState::Cancelled);

  let seen = ticks.load(Ordering::SeqCst);
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(ticks.load(Ordering::SeqCst), seen);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panic_is_reported_as_failure() {
  let completions: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
  let sink = Arc::clone(&completions);
  let scheduler = TrackingScheduler::new("panics", Handle::current(), move |failure| {
    let is_panic = failure
      .as_ref()
      .map(|f| matches!(f.cause, FailureCause::Panic(_)))
      .unwrap_or(false);
    sink.lock().unwrap().push(is_panic);
  });

  let handle = scheduler.submit("boom", async {
    let readings: Vec<u32> = Vec::new();
    let _first = readings[0];
    Ok(())
  });

  wait_for(|| !completions.lock().unwrap().is_empty()).await;
  assert_eq!(*completions.lock().unwrap(), vec![true]);
  assert_eq!(handle.state(), TaskState::Failed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_running_task_refuses_non_interrupting_cancel() {
  let (scheduler, completions) = recording_scheduler();
  let release = Arc::new(Notify::new());
  let gate = Arc::clone(&release);
  let handle = scheduler.submit("blocked", async move {
    gate.notified().await;
    Ok(())
  });

  wait_for(|| handle.state() == TaskState::Running).await;
  let report = scheduler.cancel_all(false);
  assert_eq!(
    report,
    CancelReport {
      cancelled: 0,
      refused: 1
    }
  );
  assert!(scheduler.has_active_tasks());

  release.notify_one();
  wait_for(|| handle.state() == TaskState::Done).await;
  assert!(!scheduler.has_active_tasks());
  // A shut-down scheduler no longer reports natural completion.
  assert!(completions.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interrupting_cancel_stops_running_task() {
  let (scheduler, _completions) = recording_scheduler();
  let handle = scheduler.submit("forever", async {
    std::future::pending::<()>().await;
    Ok(())
  });

  wait_for(|| handle.state() == TaskState::Running).await;
  let report = scheduler.cancel_all(true);
  assert_eq!(report.cancelled, 1);
  assert_eq!(handle.state(), TaskState::Cancelled);
  assert!(!scheduler.has_active_tasks());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tasks_scheduled_after_shutdown_never_run() {
  let (scheduler, _completions) = recording_scheduler();
  scheduler.cancel_all(true);

  let ran = Arc::new(AtomicUsize::new(0));
  let flag = Arc::clone(&ran);
  let handle = scheduler.submit("late", async move {
    flag.fetch_add(1, Ordering::SeqCst);
    Ok(())
  });

  tokio::time::sleep(Duration::from_millis(20)).await;
  assert_eq!(handle.state(), TaskState::Cancelled);
  assert_eq!(ran.load(Ordering::SeqCst), 0);
  assert!(!scheduler.has_active_tasks());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_delayed_task_never_runs() {
  let (scheduler, completions) = recording_scheduler();
  let ran = Arc::new(AtomicUsize::new(0));
  let flag = Arc::clone(&ran);
  let handle = scheduler.schedule("delayed", Duration::from_millis(20), async move {
    flag.fetch_add(1, Ordering::SeqCst);
    Ok(())
  });

  assert!(handle.cancel(false));
  assert!(!handle.cancel(true));
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(ran.load(Ordering::SeqCst), 0);
  assert!(!scheduler.has_active_tasks());
  assert!(completions.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_periodic_task_keeps_firing() {
  let (scheduler, completions) = recording_scheduler();
  let ticks = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&ticks);
  let handle = scheduler.schedule_periodic(
    "tick",
    Duration::ZERO,
    Duration::from_millis(10),
    move || {
      let counter = Arc::clone(&counter);
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    },
  );

  wait_for(|| ticks.load(Ordering::SeqCst) >= 3).await;
  assert!(handle.is_periodic());
  assert!(!handle.state().is_terminal());
  assert!(scheduler.has_active_tasks());
  assert!(completions.lock().unwrap().is_empty());
  assert!(handle.cancel(true));
}

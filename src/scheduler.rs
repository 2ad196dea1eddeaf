//! # Task-Tracking Scheduler
//!
//! Runs a job's tasks on the tokio worker pool and keeps track of every
//! outstanding unit of work so the job knows when it has finished, and so a
//! single failing task can bring the whole job down safely.
//!
//! ## Task lifecycle
//!
//! `Scheduled → Running → {Done, Cancelled, Failed}`. A periodic task goes
//! back to `Scheduled` after each firing until it is cancelled or fails.
//!
//! ## Completion callback
//!
//! The scheduler is created with a single completion callback:
//!
//! - `Some(failure)` is reported exactly once, by the first task whose body
//!   returns an error or panics. Before reporting, every other tracked task is
//!   cancelled.
//! - `None` is reported when a one-shot task finishes and no other tracked
//!   task is running or waiting to run.
//!
//! Once a failure was reported or [`TrackingScheduler::cancel_all`] ran, no
//! further `None` completions are reported and newly scheduled tasks are
//! cancelled immediately.

use crate::error::{FailureCause, OpletError, TaskFailure};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Shortest period accepted for periodic tasks.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Callback invoked when the scheduler's work is finished or has failed.
pub type Completer = Arc<dyn Fn(Option<Arc<TaskFailure>>) + Send + Sync>;

/// Id of a task, unique within its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// State of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
  /// Waiting for its start time or next period.
  Scheduled = 0,
  /// The body is executing.
  Running = 1,
  /// A one-shot task finished normally.
  Done = 2,
  /// The task was cancelled.
  Cancelled = 3,
  /// The body returned an error or panicked.
  Failed = 4,
}

impl TaskState {
  fn from_u8(value: u8) -> Self {
    match value {
      0 => TaskState::Scheduled,
      1 => TaskState::Running,
      2 => TaskState::Done,
      3 => TaskState::Cancelled,
      _ => TaskState::Failed,
    }
  }

  /// Whether the task can no longer run.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      TaskState::Done | TaskState::Cancelled | TaskState::Failed
    )
  }
}

/// Outcome of a bulk cancellation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelReport {
  /// Tasks that were cancelled.
  pub cancelled: usize,
  /// Tasks that could not be cancelled: already finished, or running while
  /// interruption was not allowed.
  pub refused: usize,
}

struct TrackedTask {
  id: TaskId,
  name: String,
  periodic: bool,
  state: AtomicU8,
  abort: Mutex<Option<AbortHandle>>,
}

impl TrackedTask {
  fn state(&self) -> TaskState {
    TaskState::from_u8(self.state.load(Ordering::Acquire))
  }

  fn transition(&self, from: TaskState, to: TaskState) -> bool {
    self
      .state
      .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  fn set_abort(&self, handle: AbortHandle) {
    *self.abort.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
  }

  fn cancel(&self, may_interrupt: bool) -> bool {
    loop {
      let current = self.state();
      let allowed = match current {
        TaskState::Scheduled => true,
        TaskState::Running => may_interrupt,
        _ => false,
      };
      if !allowed {
        return false;
      }
      if self.transition(current, TaskState::Cancelled) {
        if let Some(handle) = self
          .abort
          .lock()
          .unwrap_or_else(PoisonError::into_inner)
          .take()
        {
          handle.abort();
        }
        return true;
      }
    }
  }
}

struct SchedulerInner {
  name: String,
  runtime: Handle,
  tasks: Mutex<HashMap<TaskId, Arc<TrackedTask>>>,
  next_id: AtomicU64,
  completer: Completer,
  failed: AtomicBool,
  shut_down: AtomicBool,
}

/// Scheduler that tracks every task it runs.
///
/// Cloning is cheap; clones share the same task set.
#[derive(Clone)]
pub struct TrackingScheduler {
  inner: Arc<SchedulerInner>,
}

impl fmt::Debug for TrackingScheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TrackingScheduler")
      .field("name", &self.inner.name)
      .field("tracked", &self.tasks().len())
      .field("failed", &self.inner.failed.load(Ordering::Acquire))
      .finish()
  }
}

impl TrackingScheduler {
  /// Creates a scheduler spawning onto `runtime`.
  pub fn new<F>(name: impl Into<String>, runtime: Handle, completer: F) -> Self
  where
    F: Fn(Option<Arc<TaskFailure>>) + Send + Sync + 'static,
  {
    Self {
      inner: Arc::new(SchedulerInner {
        name: name.into(),
        runtime,
        tasks: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(0),
        completer: Arc::new(completer),
        failed: AtomicBool::new(false),
        shut_down: AtomicBool::new(false),
      }),
    }
  }

  /// Name of the scheduler, usually the job name.
  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Runtime the tasks are spawned on.
  pub fn runtime(&self) -> &Handle {
    &self.inner.runtime
  }

  /// Whether a task failure has been reported.
  pub fn has_failed(&self) -> bool {
    self.inner.failed.load(Ordering::Acquire)
  }

  /// Whether `cancel_all` has run.
  pub fn is_shut_down(&self) -> bool {
    self.inner.shut_down.load(Ordering::Acquire)
  }

  /// Runs `body` once, as soon as a worker is available.
  pub fn submit<F>(&self, name: impl Into<String>, body: F) -> TaskHandle
  where
    F: Future<Output = Result<(), OpletError>> + Send + 'static,
  {
    self.spawn_one_shot(name.into(), None, body)
  }

  /// Runs `body` once after `delay`.
  pub fn schedule<F>(&self, name: impl Into<String>, delay: Duration, body: F) -> TaskHandle
  where
    F: Future<Output = Result<(), OpletError>> + Send + 'static,
  {
    self.spawn_one_shot(name.into(), Some(delay), body)
  }

  /// Runs a fresh future from `factory` every `period`, starting after
  /// `initial_delay`. A firing that overruns its period delays the next one
  /// rather than bunching them up.
  pub fn schedule_periodic<F, Fut>(
    &self,
    name: impl Into<String>,
    initial_delay: Duration,
    period: Duration,
    mut factory: F,
  ) -> TaskHandle
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), OpletError>> + Send + 'static,
  {
    let task = self.register(name.into(), true);
    if task.state() == TaskState::Scheduled {
      let scheduler = self.clone();
      let tracked = Arc::clone(&task);
      let period = period.max(MIN_PERIOD);
      let join = self.inner.runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
          ticker.tick().await;
          if !tracked.transition(TaskState::Scheduled, TaskState::Running) {
            return;
          }
          let outcome = AssertUnwindSafe(async { factory().await })
            .catch_unwind()
            .await;
          match outcome {
            Ok(Ok(())) => {
              if !tracked.transition(TaskState::Running, TaskState::Scheduled) {
                return;
              }
            }
            outcome => {
              scheduler.finish(&tracked, outcome);
              return;
            }
          }
        }
      });
      task.set_abort(join.abort_handle());
    }
    self.handle(task)
  }

  /// Non-blocking check for live work.
  ///
  /// Tasks observed in a terminal state are dropped from the tracked set as a
  /// side effect.
  pub fn has_active_tasks(&self) -> bool {
    let mut tasks = self.tasks();
    tasks.retain(|_, task| !task.state().is_terminal());
    !tasks.is_empty()
  }

  /// Number of tracked tasks that are scheduled or running.
  pub fn active_task_count(&self) -> usize {
    self
      .tasks()
      .values()
      .filter(|task| !task.state().is_terminal())
      .count()
  }

  /// Cancels every tracked task and refuses new ones from now on.
  ///
  /// Running tasks are only interrupted when `may_interrupt` is set; those
  /// left running are reported as refused and stay tracked.
  pub fn cancel_all(&self, may_interrupt: bool) -> CancelReport {
    self.inner.shut_down.store(true, Ordering::Release);
    let mut report = CancelReport::default();
    let mut tasks = self.tasks();
    tasks.retain(|_, task| {
      if task.cancel(may_interrupt) {
        report.cancelled += 1;
        false
      } else {
        report.refused += 1;
        !task.state().is_terminal()
      }
    });
    drop(tasks);
    debug!(
      scheduler = %self.inner.name,
      cancelled = report.cancelled,
      refused = report.refused,
      "cancelled tracked tasks"
    );
    report
  }

  fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Arc<TrackedTask>>> {
    self
      .inner
      .tasks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn handle(&self, task: Arc<TrackedTask>) -> TaskHandle {
    TaskHandle {
      task,
      scheduler: self.clone(),
    }
  }

  fn register(&self, name: String, periodic: bool) -> Arc<TrackedTask> {
    let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
    let mut tasks = self.tasks();
    let shut_down = self.is_shut_down();
    let task = Arc::new(TrackedTask {
      id,
      name,
      periodic,
      state: AtomicU8::new(if shut_down {
        TaskState::Cancelled as u8
      } else {
        TaskState::Scheduled as u8
      }),
      abort: Mutex::new(None),
    });
    if shut_down {
      debug!(scheduler = %self.inner.name, task = %task.name, "scheduler shut down, task not started");
    } else {
      tasks.insert(id, Arc::clone(&task));
    }
    task
  }

  fn spawn_one_shot<F>(&self, name: String, delay: Option<Duration>, body: F) -> TaskHandle
  where
    F: Future<Output = Result<(), OpletError>> + Send + 'static,
  {
    let task = self.register(name, false);
    if task.state() == TaskState::Scheduled {
      let scheduler = self.clone();
      let tracked = Arc::clone(&task);
      let join = self.inner.runtime.spawn(async move {
        if let Some(delay) = delay {
          tokio::time::sleep(delay).await;
        }
        if !tracked.transition(TaskState::Scheduled, TaskState::Running) {
          return;
        }
        let outcome = AssertUnwindSafe(body).catch_unwind().await;
        scheduler.finish(&tracked, outcome);
      });
      task.set_abort(join.abort_handle());
    }
    self.handle(task)
  }

  fn finish(
    &self,
    task: &Arc<TrackedTask>,
    outcome: Result<Result<(), OpletError>, Box<dyn Any + Send>>,
  ) {
    if task.state() == TaskState::Cancelled {
      return;
    }
    match outcome {
      Ok(Ok(())) => {
        task.transition(TaskState::Running, TaskState::Done);
        self.untrack(task.id);
        if !task.periodic {
          self.check_idle();
        }
      }
      Ok(Err(err)) => self.fail(task, FailureCause::Error(err)),
      Err(payload) => self.fail(task, FailureCause::Panic(panic_message(payload.as_ref()))),
    }
  }

  fn fail(&self, task: &Arc<TrackedTask>, cause: FailureCause) {
    task.state.store(TaskState::Failed as u8, Ordering::Release);
    self.untrack(task.id);
    let failure = Arc::new(TaskFailure {
      task_id: task.id,
      task: task.name.clone(),
      cause,
    });
    error!(scheduler = %self.inner.name, error = %failure, "task failed");

    if !self.inner.failed.swap(true, Ordering::AcqRel) {
      let report = self.cancel_all(true);
      if report.refused > 0 {
        warn!(
          scheduler = %self.inner.name,
          refused = report.refused,
          "some tasks refused cancellation after failure"
        );
      }
      (self.inner.completer)(Some(failure));
    }
  }

  fn untrack(&self, id: TaskId) {
    self.tasks().remove(&id);
  }

  fn check_idle(&self) {
    let idle = {
      let tasks = self.tasks();
      let (running, scheduled) =
        tasks
          .values()
          .fold((0usize, 0usize), |(running, scheduled), task| match task.state() {
            TaskState::Running => (running + 1, scheduled),
            TaskState::Scheduled => (running, scheduled + 1),
            _ => (running, scheduled),
          });
      tasks.is_empty() || (running == 0 && scheduled == 0)
    };
    if idle && !self.has_failed() && !self.is_shut_down() {
      debug!(scheduler = %self.inner.name, "no remaining work");
      (self.inner.completer)(None);
    }
  }
}

/// Handle to a scheduled task.
#[derive(Clone)]
pub struct TaskHandle {
  task: Arc<TrackedTask>,
  scheduler: TrackingScheduler,
}

impl TaskHandle {
  /// Id of the task.
  pub fn id(&self) -> TaskId {
    self.task.id
  }

  /// Name the task was scheduled under.
  pub fn name(&self) -> &str {
    &self.task.name
  }

  /// Whether the task repeats.
  pub fn is_periodic(&self) -> bool {
    self.task.periodic
  }

  /// Current state of the task.
  pub fn state(&self) -> TaskState {
    self.task.state()
  }

  /// Cancels the task. Returns `false` if it already finished, or if it is
  /// running and `may_interrupt` is not set.
  pub fn cancel(&self, may_interrupt: bool) -> bool {
    let cancelled = self.task.cancel(may_interrupt);
    if cancelled {
      self.scheduler.untrack(self.task.id);
    }
    cancelled
  }
}

impl fmt::Debug for TaskHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskHandle")
      .field("id", &self.task.id)
      .field("name", &self.task.name)
      .field("state", &self.task.state())
      .finish()
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

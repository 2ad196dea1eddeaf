//! # Jobs
//!
//! A [`Job`] is a running instance of a submitted topology. It owns the
//! scheduler that runs the topology's tasks and moves through
//! `Constructed → Running → Stopping → Closed`.
//!
//! ## Launch
//!
//! 1. Every oplet is initialized, consumers before producers.
//! 2. The job becomes `Running`.
//! 3. Every oplet is started, consumers before producers, so sources begin
//!    emitting last.
//!
//! ## Teardown
//!
//! A supervisor task waits for the first of:
//!
//! - the scheduler reporting that no work is left,
//! - the scheduler reporting a task failure,
//! - [`Job::request_stop`].
//!
//! It then moves the job to `Stopping`, cancels every tracked task, closes
//! every oplet in topological order and finally moves the job to `Closed`.
//! A failure is kept as [`Job::last_error`] and marks the job unhealthy.

use crate::config::RuntimeConfig;
use crate::error::{JobError, OpletError, TaskFailure};
use crate::graph::{Stage, VertexId};
use crate::oplet::{Emitter, OpletCell, OpletContext, Target};
use crate::scheduler::TrackingScheduler;
use crate::topology::Topology;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  /// Oplets are being initialized.
  Constructed,
  /// Oplets are started and tuples flow.
  Running,
  /// Tasks are being cancelled and oplets closed.
  Stopping,
  /// Teardown finished.
  Closed,
}

/// Whether the job has seen a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
  /// No task has failed.
  Healthy,
  /// A task failed; see [`Job::last_error`].
  Unhealthy,
}

enum JobEvent {
  Completed(Option<Arc<TaskFailure>>),
  StopRequested,
}

struct JobInner {
  id: String,
  name: String,
  state: watch::Sender<JobState>,
  scheduler: TrackingScheduler,
  events: mpsc::UnboundedSender<JobEvent>,
  last_error: Mutex<Option<Arc<TaskFailure>>>,
  close_timeout: Duration,
}

/// Handle to a running topology.
///
/// Cloning is cheap; all clones control the same job. Dropping every handle
/// does not stop the job.
#[derive(Clone)]
pub struct Job {
  inner: Arc<JobInner>,
}

impl fmt::Debug for Job {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Job")
      .field("id", &self.inner.id)
      .field("name", &self.inner.name)
      .field("state", &self.state())
      .field("health", &self.health())
      .finish()
  }
}

impl Job {
  /// Finalizes `topology` and runs it on `runtime`.
  pub(crate) async fn launch(
    id: String,
    topology: &Topology,
    runtime: Handle,
    config: &RuntimeConfig,
  ) -> Result<Job, JobError> {
    let (stages, order) = topology.finalize()?;
    let (events, mut event_rx) = mpsc::unbounded_channel();

    let completions = events.clone();
    let scheduler = TrackingScheduler::new(topology.name(), runtime.clone(), move |failure| {
      let _ = completions.send(JobEvent::Completed(failure));
    });

    let (state, _) = watch::channel(JobState::Constructed);
    let job = Job {
      inner: Arc::new(JobInner {
        id,
        name: topology.name().to_string(),
        state,
        scheduler: scheduler.clone(),
        events,
        last_error: Mutex::new(None),
        close_timeout: config.close_timeout(),
      }),
    };
    debug!(job = %job.inner.id, name = %job.inner.name, oplets = stages.len(), "constructing job");

    let (names, cells, mut contexts) = wire(stages, &scheduler);
    let stop_on_error = |name: &str, source: OpletError| JobError::Start {
      name: name.to_string(),
      source,
    };

    // Holds off natural completion until every source has started.
    let (launched, launch_gate) = oneshot::channel::<()>();
    scheduler.submit("launch", async move {
      let _ = launch_gate.await;
      Ok(())
    });

    for id in order.iter().rev() {
      let Some(ctx) = contexts[id.index()].take() else {
        continue;
      };
      let result = cells[id.index()].lock().await.initialize(ctx).await;
      if let Err(source) = result {
        job.abort_launch(&cells, &order, &names).await;
        return Err(stop_on_error(&names[id.index()], source));
      }
    }

    job.set_state(JobState::Running);
    for id in order.iter().rev() {
      let result = cells[id.index()].lock().await.start().await;
      if let Err(source) = result {
        job.abort_launch(&cells, &order, &names).await;
        return Err(stop_on_error(&names[id.index()], source));
      }
    }
    let _ = launched.send(());

    let supervised = job.clone();
    runtime.spawn(async move {
      let failure = match event_rx.recv().await {
        Some(JobEvent::Completed(failure)) => failure,
        Some(JobEvent::StopRequested) | None => None,
      };
      supervised.teardown(&cells, &order, &names, failure).await;
    });
    Ok(job)
  }

  /// Id assigned by the provider.
  pub fn id(&self) -> &str {
    &self.inner.id
  }

  /// Name of the submitted topology.
  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Current lifecycle state.
  pub fn state(&self) -> JobState {
    *self.inner.state.borrow()
  }

  /// `Unhealthy` once a task has failed.
  pub fn health(&self) -> Health {
    if self.last_error().is_some() || self.inner.scheduler.has_failed() {
      Health::Unhealthy
    } else {
      Health::Healthy
    }
  }

  /// The failure that stopped the job, if any.
  pub fn last_error(&self) -> Option<Arc<TaskFailure>> {
    self
      .inner
      .last_error
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Whether the job's scheduler still tracks live tasks.
  pub fn has_active_tasks(&self) -> bool {
    self.inner.scheduler.has_active_tasks()
  }

  /// Asks the job to stop. Returns immediately; see [`Job::wait_closed`].
  pub fn request_stop(&self) {
    if self.inner.events.send(JobEvent::StopRequested).is_err() {
      debug!(job = %self.inner.id, "stop requested after teardown");
    }
  }

  /// Waits until the job is `Closed`.
  ///
  /// # Errors
  ///
  /// Returns [`JobError::Timeout`] if the job is not closed within `timeout`.
  pub async fn wait_closed(&self, timeout: Duration) -> Result<(), JobError> {
    let mut state = self.inner.state.subscribe();
    tokio::time::timeout(timeout, state.wait_for(|state| *state == JobState::Closed))
      .await
      .map_err(|_| JobError::Timeout(timeout))?
      .map(|_| ())
      .map_err(|_| JobError::Timeout(timeout))
  }

  /// Requests a stop and waits for the job to close, bounded by the
  /// configured close timeout.
  pub async fn stop(&self) -> Result<(), JobError> {
    self.request_stop();
    self.wait_closed(self.inner.close_timeout).await
  }

  fn set_state(&self, state: JobState) {
    let previous = self.inner.state.send_replace(state);
    if previous != state {
      info!(job = %self.inner.id, name = %self.inner.name, from = ?previous, to = ?state, "job state changed");
    }
  }

  async fn abort_launch(&self, cells: &[OpletCell], order: &[VertexId], names: &[String]) {
    self.set_state(JobState::Stopping);
    self.inner.scheduler.cancel_all(true);
    self.close_all(cells, order, names).await;
    self.set_state(JobState::Closed);
  }

  /// Closes every oplet in `order`, logging and moving past close failures.
  async fn close_all(&self, cells: &[OpletCell], order: &[VertexId], names: &[String]) {
    for id in order {
      if let Err(err) = cells[id.index()].lock().await.close().await {
        warn!(job = %self.inner.id, oplet = %names[id.index()], error = %err, "failed to close oplet");
      }
    }
  }

  async fn teardown(
    &self,
    cells: &[OpletCell],
    order: &[VertexId],
    names: &[String],
    failure: Option<Arc<TaskFailure>>,
  ) {
    self.set_state(JobState::Stopping);
    let report = self.inner.scheduler.cancel_all(true);
    if report.refused > 0 {
      warn!(job = %self.inner.id, refused = report.refused, "tasks refused cancellation");
    }

    self.close_all(cells, order, names).await;

    if let Some(failure) = failure {
      *self
        .inner
        .last_error
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(failure);
    }
    self.set_state(JobState::Closed);
  }
}

/// Places every oplet in its cell and builds the emitters for each output
/// port from the stage routes.
fn wire(
  stages: Vec<Stage>,
  scheduler: &TrackingScheduler,
) -> (Vec<String>, Vec<OpletCell>, Vec<Option<OpletContext>>) {
  let mut names = Vec::with_capacity(stages.len());
  let mut cells: Vec<OpletCell> = Vec::with_capacity(stages.len());
  let mut routes = Vec::with_capacity(stages.len());
  for stage in stages {
    names.push(stage.name);
    cells.push(Arc::new(tokio::sync::Mutex::new(stage.oplet)));
    routes.push((stage.id, stage.outputs));
  }

  let contexts = routes
    .into_iter()
    .map(|(id, outputs)| {
      let emitters = outputs
        .into_iter()
        .map(|targets| {
          Emitter::new(
            targets
              .into_iter()
              .map(|(target, port)| Target {
                cell: Arc::clone(&cells[target.index()]),
                port,
              })
              .collect(),
          )
        })
        .collect();
      Some(OpletContext::new(
        id,
        names[id.index()].clone(),
        emitters,
        scheduler.clone(),
      ))
    })
    .collect();
  (names, cells, contexts)
}

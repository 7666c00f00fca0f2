//! Run engine.
//!
//! [`Executor::run`] drives a compiled [`Schedule`] against hardware. Every
//! active component gets its own tokio task that owns the component's
//! [`Driver`] and walks through
//!
//! ```text
//! Idle -> Acquiring -> Running -> Restoring -> Released
//!                         \-> Failed -> Restoring -> Released
//! ```
//!
//! All tasks acquire concurrently. Once every acquisition has settled the
//! executor publishes a common origin instant; procedure start times and the
//! sensor polling window are measured from it.
//!
//! A run-wide [`CancellationToken`] is observed while waiting for the origin,
//! while waiting for a procedure's start time, and inside `apply`/`read`.
//! Restoration is never cancelled; it is bounded by `restore_timeout` instead.
//! A failing or panicking component restores and releases itself without
//! disturbing the others. Failures are aggregated into [`RunFailed`] once every component
//! has been released.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::data::{LogRecord, LogSink, RecordKind};
use crate::error::{AppResult, DriverError, FlowError, RunFailed};
use crate::hardware::{validate_binding, Driver};
use crate::schedule::{CompiledTimeline, Schedule};

/// Drivers keyed by component name.
pub type DriverMap = HashMap<String, Box<dyn Driver>>;

/// Lifecycle phase of one component during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Not yet started.
    Idle,
    /// Waiting on `acquire`.
    Acquiring,
    /// Following the timeline.
    Running,
    /// A driver call failed; restoration follows if the resource was acquired.
    Failed,
    /// Applying the base state.
    Restoring,
    /// Resource released. Terminal.
    Released,
}

/// What happened to one component.
#[derive(Debug)]
pub struct ComponentOutcome {
    /// Component name.
    pub component: String,
    /// Every phase entered, in order.
    pub phases: Vec<Phase>,
    /// Scheduled procedures successfully applied (the restore is not counted).
    pub applied: usize,
    /// Sensor readings taken.
    pub readings: usize,
    /// The error that sent the component to `Failed`.
    pub error: Option<DriverError>,
    /// Logged, never raised.
    pub restore_error: Option<DriverError>,
    /// Logged, never raised.
    pub release_error: Option<DriverError>,
}

impl ComponentOutcome {
    fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            phases: vec![Phase::Idle],
            applied: 0,
            readings: 0,
            error: None,
            restore_error: None,
            release_error: None,
        }
    }

    /// The last phase entered.
    pub fn final_phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Idle)
    }
}

/// Summary of a finished run.
#[derive(Debug)]
pub struct RunReport {
    /// Names the run in logs and file names.
    pub run_id: Uuid,
    /// Wall-clock start, taken before acquisition.
    pub started_at: DateTime<Utc>,
    /// One per scheduled component, in schedule order.
    pub outcomes: Vec<ComponentOutcome>,
    /// Whether the cancellation token fired.
    pub cancelled: bool,
}

impl RunReport {
    /// Outcome of one component.
    pub fn outcome(&self, component: &str) -> Option<&ComponentOutcome> {
        self.outcomes.iter().find(|o| o.component == component)
    }

    /// True when no component failed. Restore and release errors do not count.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.error.is_none())
    }

    /// Splits off the component errors. `Ok` when no component failed.
    pub fn into_result(mut self) -> Result<RunReport, RunFailed> {
        let failures: Vec<(String, DriverError)> = self
            .outcomes
            .iter_mut()
            .filter_map(|o| o.error.take().map(|e| (o.component.clone(), e)))
            .collect();
        if failures.is_empty() {
            Ok(self)
        } else {
            Err(RunFailed { failures })
        }
    }
}

/// Executes schedules.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    config: ExecutorConfig,
    run_id: Option<Uuid>,
}

impl Executor {
    /// An executor with the given timing. The config is validated when a run starts.
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            run_id: None,
        }
    }

    /// Uses `run_id` for the next run instead of a fresh one, so the data log
    /// can be named before the run starts.
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Runs `schedule` and fails with [`RunFailed`] if any component failed.
    pub async fn run(
        &self,
        schedule: &Schedule,
        drivers: DriverMap,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> AppResult<RunReport> {
        let report = self.execute(schedule, drivers, sink, cancel).await?;
        Ok(report.into_result()?)
    }

    /// Runs `schedule` and returns the full report, failed components included.
    ///
    /// # Errors
    ///
    /// Only preflight problems are returned: an invalid executor configuration,
    /// a run too long for the clock, a component without a driver, or a driver
    /// that cannot serve its component. Nothing is acquired in that case.
    pub async fn execute(
        &self,
        schedule: &Schedule,
        mut drivers: DriverMap,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> AppResult<RunReport> {
        self.config.validate()?;
        // the origin is set at most one acquire timeout from now
        Instant::now()
            .checked_add(self.config.acquire_timeout)
            .and_then(|latest| latest.checked_add(schedule.duration))
            .ok_or(FlowError::DurationOutOfRange(schedule.duration))?;

        let mut bound = Vec::with_capacity(schedule.timelines.len());
        for (name, timeline) in &schedule.timelines {
            let driver = drivers
                .remove(name)
                .ok_or_else(|| FlowError::MissingDriver(name.clone()))?;
            validate_binding(&timeline.component, driver.as_ref()).map_err(|reason| {
                FlowError::InvalidBinding {
                    component: name.clone(),
                    reason,
                }
            })?;
            bound.push((timeline.clone(), driver));
        }
        for name in drivers.keys() {
            warn!(component = %name, "driver bound to a component that is not scheduled; ignoring");
        }

        let run_id = self.run_id.unwrap_or_else(Uuid::new_v4);
        let started_at = Utc::now();
        info!(
            %run_id,
            protocol = %schedule.name,
            components = bound.len(),
            duration = ?schedule.duration,
            "starting run"
        );

        let (acquired_tx, mut acquired_rx) = mpsc::channel::<()>(bound.len().max(1));
        let (origin_tx, origin_rx) = watch::channel::<Option<Instant>>(None);

        let handles: Vec<_> = bound
            .into_iter()
            .map(|(timeline, driver)| {
                let task = ComponentTask {
                    name: timeline.component.name().to_string(),
                    timeline,
                    driver,
                    duration: schedule.duration,
                    config: self.config.clone(),
                    sink: Arc::clone(&sink),
                    cancel: cancel.clone(),
                    acquired: Some(acquired_tx.clone()),
                    origin: origin_rx.clone(),
                    outcome: None,
                };
                let name = task.name.clone();
                (name, tokio::spawn(task.run()))
            })
            .collect();
        drop(acquired_tx);

        // every task reports once, whether its acquisition succeeded or not
        while acquired_rx.recv().await.is_some() {}
        let origin = Instant::now();
        origin_tx.send_replace(Some(origin));
        debug!(%run_id, "all components acquired; timeline origin set");

        let mut outcomes = Vec::with_capacity(handles.len());
        let (names, tasks): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (name, joined) in names.into_iter().zip(join_all(tasks).await) {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(component = %name, "component task aborted: {}", e);
                    let mut outcome = ComponentOutcome::new(&name);
                    outcome.phases.push(Phase::Failed);
                    outcome.error = Some(DriverError::Device(format!("task aborted: {}", e)));
                    outcomes.push(outcome);
                }
            }
        }

        if let Err(e) = sink.flush() {
            warn!(%run_id, "failed to flush data log: {}", e);
        }

        let report = RunReport {
            run_id,
            started_at,
            outcomes,
            cancelled: cancel.is_cancelled(),
        };
        info!(
            %run_id,
            cancelled = report.cancelled,
            success = report.is_success(),
            elapsed = ?origin.elapsed(),
            "run finished"
        );
        Ok(report)
    }
}

/// Runs a driver call, turning a panic into a `DriverError`.
async fn guarded<T>(call: impl Future<Output = Result<T, DriverError>>) -> Result<T, DriverError> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Device("driver panicked".into())),
    }
}

fn out_of_range(by: Duration) -> DriverError {
    DriverError::Device(format!("{:?} past the origin is beyond the clock's range", by))
}

/// Why the running phase ended.
enum Ending {
    Completed,
    Cancelled,
    Failed(DriverError),
}

struct ComponentTask {
    name: String,
    timeline: CompiledTimeline,
    driver: Box<dyn Driver>,
    duration: Duration,
    config: ExecutorConfig,
    sink: Arc<dyn LogSink>,
    cancel: CancellationToken,
    acquired: Option<mpsc::Sender<()>>,
    origin: watch::Receiver<Option<Instant>>,
    outcome: Option<ComponentOutcome>,
}

impl ComponentTask {
    async fn run(mut self) -> ComponentOutcome {
        self.outcome = Some(ComponentOutcome::new(&self.name));

        self.enter(Phase::Acquiring, None);
        let acquired = tokio::time::timeout(
            self.config.acquire_timeout,
            guarded(self.driver.acquire()),
        )
        .await
        .unwrap_or(Err(DriverError::Timeout {
            operation: "acquire",
            after: self.config.acquire_timeout,
        }));
        self.report_acquired().await;

        if let Err(e) = acquired {
            error!(component = %self.name, "acquire failed: {}", e);
            self.fail(e);
            return self.finish();
        }

        // a panic past this point must still reach restore and release
        let ending = AssertUnwindSafe(self.running())
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Ending::Failed(DriverError::Device("component task panicked".into())));

        match ending {
            Ending::Completed => debug!(component = %self.name, "timeline complete"),
            Ending::Cancelled => info!(component = %self.name, "cancelled; restoring base state"),
            Ending::Failed(e) => {
                error!(component = %self.name, "driver error: {}", e);
                self.fail(e);
            }
        }

        self.restore().await;
        self.release().await;
        self.finish()
    }

    async fn running(&mut self) -> Ending {
        match self.wait_for_origin().await {
            None => Ending::Cancelled,
            Some(origin) => {
                self.enter(Phase::Running, None);
                if self.timeline.component.is_sensor() {
                    self.poll(origin).await
                } else {
                    self.drive(origin).await
                }
            }
        }
    }

    async fn report_acquired(&mut self) {
        if let Some(tx) = self.acquired.take() {
            // the receiver only disappears if the executor itself was dropped
            let _ = tx.send(()).await;
        }
    }

    async fn wait_for_origin(&mut self) -> Option<Instant> {
        let cancel = self.cancel.clone();
        let origin = &mut self.origin;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = origin.wait_for(Option::is_some) => result.ok().and_then(|o| *o),
        }
    }

    /// Applies every procedure at its start time, then holds until the end of the run.
    async fn drive(&mut self, origin: Instant) -> Ending {
        let cancel = self.cancel.clone();
        let procedures = self.timeline.procedures.clone();

        for procedure in &procedures {
            let Some(due) = origin.checked_add(procedure.start) else {
                return Ending::Failed(out_of_range(procedure.start));
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ending::Cancelled,
                _ = sleep_until(due) => {}
            }

            let lateness = Instant::now().saturating_duration_since(due);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ending::Cancelled,
                r = guarded(self.driver.apply(&procedure.state)) => r,
            };
            if let Err(e) = result {
                return Ending::Failed(e);
            }

            self.timeline.component.live().update(&procedure.state);
            if let Some(outcome) = self.outcome.as_mut() {
                outcome.applied += 1;
            }
            if lateness > Duration::from_millis(100) {
                warn!(component = %self.name, ?lateness, "procedure applied late");
            }
            self.log(
                RecordKind::Transition,
                json!({
                    "t": origin.elapsed().as_secs_f64(),
                    "scheduled": procedure.start.as_secs_f64(),
                    "phase": Phase::Running,
                    "origin": procedure.origin,
                    "state": procedure.state,
                }),
            );
        }

        let Some(end) = origin.checked_add(self.duration) else {
            return Ending::Failed(out_of_range(self.duration));
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ending::Cancelled,
            _ = sleep_until(end) => Ending::Completed,
        }
    }

    /// Reads the sensor every poll interval over `[origin, origin + duration)`.
    async fn poll(&mut self, origin: Instant) -> Ending {
        let cancel = self.cancel.clone();
        let Some(end) = origin.checked_add(self.duration) else {
            return Ending::Failed(out_of_range(self.duration));
        };
        let mut ticker = interval_at(origin, self.config.sensor_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = sleep_until(end);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ending::Cancelled,
                _ = &mut deadline => return Ending::Completed,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ending::Cancelled,
                r = guarded(self.driver.read()) => r,
            };
            match result {
                Ok(value) => {
                    if let Some(outcome) = self.outcome.as_mut() {
                        outcome.readings += 1;
                    }
                    self.log(
                        RecordKind::Reading,
                        json!({ "t": origin.elapsed().as_secs_f64(), "value": value }),
                    );
                }
                Err(e) => return Ending::Failed(e),
            }
        }
    }

    /// Applies the base state once. Not cancellable; failures are only logged.
    async fn restore(&mut self) {
        self.enter(Phase::Restoring, None);
        let component = Arc::clone(&self.timeline.component);
        if component.is_sensor() {
            return;
        }

        let base = component.base_state().clone();
        let timeout = self.config.restore_timeout;
        let result = tokio::time::timeout(timeout, guarded(self.driver.apply(&base)))
            .await
            .unwrap_or(Err(DriverError::Timeout {
                operation: "restore",
                after: timeout,
            }));

        match result {
            Ok(()) => {
                component.live().update(&base);
                self.log(
                    RecordKind::Transition,
                    json!({ "phase": Phase::Restoring, "state": base }),
                );
            }
            Err(e) => {
                error!(component = %self.name, "failed to restore base state: {}", e);
                self.log(
                    RecordKind::Transition,
                    json!({ "phase": Phase::Restoring, "error": e.to_string() }),
                );
                if let Some(outcome) = self.outcome.as_mut() {
                    outcome.restore_error = Some(e);
                }
            }
        }
    }

    async fn release(&mut self) {
        if let Err(e) = guarded(self.driver.release()).await {
            error!(component = %self.name, "failed to release: {}", e);
            if let Some(outcome) = self.outcome.as_mut() {
                outcome.release_error = Some(e);
            }
        }
        self.enter(Phase::Released, None);
    }

    fn fail(&mut self, error: DriverError) {
        self.enter(Phase::Failed, Some(error.to_string()));
        if let Some(outcome) = self.outcome.as_mut() {
            outcome.error = Some(error);
        }
    }

    fn enter(&mut self, phase: Phase, detail: Option<String>) {
        debug!(component = %self.name, ?phase, "phase change");
        if let Some(outcome) = self.outcome.as_mut() {
            outcome.phases.push(phase);
        }
        let mut payload = json!({ "phase": phase });
        if let Some(detail) = detail {
            payload["error"] = json!(detail);
        }
        self.log(RecordKind::Transition, payload);
    }

    fn log(&self, kind: RecordKind, payload: serde_json::Value) {
        if let Err(e) = self.sink.append(LogRecord::now(&self.name, kind, payload)) {
            warn!(component = %self.name, "failed to append to data log: {}", e);
        }
    }

    fn finish(mut self) -> ComponentOutcome {
        self.outcome
            .take()
            .unwrap_or_else(|| ComponentOutcome::new(&self.name))
    }
}

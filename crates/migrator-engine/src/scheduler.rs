use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use migrator_core::{EventProducer, Pattern};
use migrator_store_sqlite::{ConnPool, DualWritePool, Record};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::validator::{Validator, DEFAULT_BATCH_SIZE, DEFAULT_QUERY_TIMEOUT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorSettings {
    pub batch_size: i64,
    pub query_timeout: Duration,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE, query_timeout: DEFAULT_QUERY_TIMEOUT }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Full,
    Incremental,
}

impl RunKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

/// Cancellation token plus completion signal for one validation run.
///
/// The idle handle owns a token nobody else holds, so cancelling it is a no-op.
struct RunHandle {
    run_id: Option<Ulid>,
    cancel: CancellationToken,
    done: Option<watch::Receiver<bool>>,
}

impl RunHandle {
    fn idle() -> Self {
        Self { run_id: None, cancel: CancellationToken::new(), done: None }
    }

    fn is_running(&self) -> bool {
        self.done.as_ref().is_some_and(|done| !*done.borrow())
    }

    fn status(&self) -> RunStatus {
        RunStatus { run_id: self.run_id.map(|id| id.to_string()), running: self.is_running() }
    }
}

/// Lets a caller observe when a started run has exited.
#[derive(Debug, Clone)]
pub struct RunWatch {
    run_id: Ulid,
    done: watch::Receiver<bool>,
}

impl RunWatch {
    #[must_use]
    pub fn run_id(&self) -> Ulid {
        self.run_id
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the run has exited, including when its task panicked.
    pub async fn finished(&mut self) {
        let _ = self.done.wait_for(|done| *done).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub run_id: Option<String>,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub pattern: Pattern,
    pub full: RunStatus,
    pub incr: RunStatus,
}

struct SchedulerState {
    pattern: Pattern,
    full: RunHandle,
    incr: RunHandle,
}

/// Control plane of one table's migration.
///
/// One mutex covers the pattern and both run handles. It is held only while
/// state changes, never while a validation runs.
pub struct Scheduler<T: Record> {
    src: Arc<dyn ConnPool>,
    dst: Arc<dyn ConnPool>,
    pool: Arc<DualWritePool>,
    producer: Arc<dyn EventProducer>,
    settings: ValidatorSettings,
    state: Mutex<SchedulerState>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Scheduler<T> {
    /// `pool` is the dual-write pool serving application traffic; `src` and
    /// `dst` are the raw stores it routes to.
    #[must_use]
    pub fn new(
        src: Arc<dyn ConnPool>,
        dst: Arc<dyn ConnPool>,
        pool: Arc<DualWritePool>,
        producer: Arc<dyn EventProducer>,
    ) -> Self {
        pool.update_pattern(Pattern::SrcOnly);
        Self {
            src,
            dst,
            pool,
            producer,
            settings: ValidatorSettings::default(),
            state: Mutex::new(SchedulerState {
                pattern: Pattern::SrcOnly,
                full: RunHandle::idle(),
                incr: RunHandle::idle(),
            }),
            _record: PhantomData,
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ValidatorSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn pattern(&self) -> Pattern {
        self.state.lock().pattern
    }

    pub fn set_pattern(&self, pattern: Pattern) {
        let mut state = self.state.lock();
        state.pattern = pattern;
        self.pool.update_pattern(pattern);
    }

    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        let state = self.state.lock();
        SchedulerStatus { pattern: state.pattern, full: state.full.status(), incr: state.incr.status() }
    }

    /// Validation always checks agreement toward the store currently serving reads.
    fn new_validator(&self, pattern: Pattern) -> Validator<T> {
        let (base, target) = if pattern.reads_from_src() {
            (self.src.clone(), self.dst.clone())
        } else {
            (self.dst.clone(), self.src.clone())
        };
        Validator::new(base, target, pattern.direction(), self.producer.clone())
            .batch_size(self.settings.batch_size)
            .query_timeout(self.settings.query_timeout)
    }

    /// Cancel any running full validation and start a new one.
    pub fn start_full_validation(&self) -> RunWatch {
        let mut state = self.state.lock();
        let validator = self.new_validator(state.pattern).full();
        state.full.cancel.cancel();
        let (handle, watch) = launch(RunKind::Full, validator);
        state.full = handle;
        watch
    }

    pub fn stop_full_validation(&self) {
        let state = self.state.lock();
        state.full.cancel.cancel();
    }

    /// Cancel any running incremental validation and start a new one from
    /// `utime`. A zero `interval` makes the run stop at end of data.
    pub fn start_increment_validation(&self, utime: i64, interval: Duration) -> RunWatch {
        let mut state = self.state.lock();
        let validator =
            self.new_validator(state.pattern).incremental(utime).sleep_interval(Some(interval));
        state.incr.cancel.cancel();
        let (handle, watch) = launch(RunKind::Incremental, validator);
        state.incr = handle;
        watch
    }

    pub fn stop_increment_validation(&self) {
        let state = self.state.lock();
        state.incr.cancel.cancel();
    }
}

impl<T: Record> Drop for Scheduler<T> {
    fn drop(&mut self) {
        let state = self.state.lock();
        state.full.cancel.cancel();
        state.incr.cancel.cancel();
    }
}

/// Marks a run finished when dropped, so a task that panics still reads as done.
struct DoneGuard(watch::Sender<bool>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.send_replace(true);
    }
}

fn spawn_run<F>(run: F) -> watch::Receiver<bool>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (done_tx, done_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _done = DoneGuard(done_tx);
        run.await;
    });
    done_rx
}

fn launch<T: Record>(kind: RunKind, validator: Validator<T>) -> (RunHandle, RunWatch) {
    let run_id = Ulid::new();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let done = spawn_run(async move {
        tracing::info!(
            %run_id,
            kind = kind.as_str(),
            direction = %validator.direction(),
            "validation run started"
        );
        match validator.validate(token).await {
            Ok(()) => tracing::info!(%run_id, kind = kind.as_str(), "validation run exited"),
            Err(err) => {
                tracing::warn!(%run_id, kind = kind.as_str(), error = %err, "validation run failed");
            }
        }
    });
    let handle = RunHandle { run_id: Some(run_id), cancel, done: Some(done.clone()) };
    (handle, RunWatch { run_id, done })
}

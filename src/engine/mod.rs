mod conflict;
mod enrollment;
mod error;
mod lifecycle;
mod queries;

pub use conflict::find_overlap;
pub use error::{EngineError, Entity, ErrorBody, StatusClass};

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{EventHook, LessonEvent};
use crate::observability::{self, EVENTS_EMITTED_TOTAL, ROLLBACKS_TOTAL};
use crate::store::{SchedulingStore, StoreError, Tx};

/// Source of "now" for every time-dependent rule.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        conflict::now_ms()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: Ms) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.0.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lesson booking engine. Holds no locks of its own: every mutation runs in
/// one store transaction and relies on the store's row locks, so any number
/// of engines may share a database.
pub struct Engine {
    store: Arc<dyn SchedulingStore>,
    hook: Arc<dyn EventHook>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(store: Arc<dyn SchedulingStore>, hook: Arc<dyn EventHook>) -> Self {
        Self {
            store,
            hook,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub(super) fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Time an operation, count its outcome and log any failure.
    pub(super) async fn observed<T>(
        &self,
        operation: &'static str,
        work: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let started = Instant::now();
        let result = work.await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_rejection() => {
                debug!(operation, code = e.code(), "rejected: {e}");
                e.code()
            }
            Err(e) => {
                error!(operation, "{e}");
                e.code()
            }
        };
        observability::record_operation(operation, outcome, started);
        result
    }

    pub(super) async fn in_tx<T, F>(&self, operation: &'static str, body: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T, EngineError>> + Send,
    {
        self.in_tx_mapped(operation, EngineError::Storage, body).await
    }

    /// Run `body` inside one store transaction: commit on `Ok`, roll back on
    /// `Err`. Storage failures, including begin and commit, go through
    /// `storage_error`.
    pub(super) async fn in_tx_mapped<T, F>(
        &self,
        operation: &'static str,
        storage_error: fn(StoreError) -> EngineError,
        body: F,
    ) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T, EngineError>> + Send,
    {
        self.observed(operation, async {
            let mut tx = self.store.begin().await.map_err(storage_error)?;
            match body(&mut tx).await {
                Ok(value) => {
                    tx.commit().await.map_err(storage_error)?;
                    Ok(value)
                }
                Err(err) => {
                    metrics::counter!(ROLLBACKS_TOTAL, "operation" => operation).increment(1);
                    if let Err(e) = tx.rollback().await {
                        warn!(operation, "rollback failed: {e}");
                    }
                    Err(match err {
                        EngineError::Storage(e) => storage_error(e),
                        other => other,
                    })
                }
            }
        })
        .await
    }

    /// `in_tx`, with the lesson row locked and loaded first.
    pub(super) async fn with_locked_lesson<T, F>(
        &self,
        operation: &'static str,
        lesson_id: Ulid,
        body: F,
    ) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t mut Tx, Lesson) -> BoxFuture<'t, Result<T, EngineError>> + Send + 'static,
    {
        self.in_tx(operation, move |tx| {
            Box::pin(async move {
                let lesson = tx
                    .lock_lesson(lesson_id)
                    .await?
                    .ok_or_else(|| EngineError::lesson_not_found(lesson_id))?;
                body(tx, lesson).await
            })
        })
        .await
    }

    /// Hand a committed event to the hook.
    pub(super) fn emit(&self, event: LessonEvent) {
        metrics::counter!(EVENTS_EMITTED_TOTAL, "event" => event.name()).increment(1);
        debug!(event = event.name(), recipients = event.recipients().len(), "emitting");
        self.hook.emit(&event);
    }
}

/// Load the lesson's tutor and make sure `user_id` is that tutor.
pub(super) async fn owning_tutor(tx: &mut Tx, lesson: &Lesson, user_id: &str) -> Result<Tutor, EngineError> {
    let tutor = tx
        .tutor_by_id(lesson.tutor_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(Entity::Tutor, lesson.tutor_id.to_string()))?;
    if tutor.user_id != user_id {
        return Err(EngineError::Unauthorized);
    }
    Ok(tutor)
}

/// Detail view built from rows already read inside a transaction.
pub(super) async fn detail_in_tx(
    tx: &mut Tx,
    lesson: Lesson,
    enrollments: Vec<Enrollment>,
) -> Result<LessonDetail, EngineError> {
    let tutor = tx
        .tutor_by_id(lesson.tutor_id)
        .await?
        .ok_or_else(|| EngineError::NotFound(Entity::Tutor, lesson.tutor_id.to_string()))?;
    Ok(LessonDetail {
        tutor_full_name: tutor.full_name,
        seats_taken: enrollments.len() as u32,
        lesson,
        enrollments,
    })
}

//! Transactional persistence seam. The engine talks only to these traits.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug)]
pub enum StoreError {
    /// Driver-level failure: connectivity, commit, rollback, serialization.
    Database(sqlx::Error),
    Migration(sqlx::migrate::MigrateError),
    /// A row came back in a shape the model cannot represent.
    Corrupt(String),
    /// Insert collided with an existing key.
    Duplicate(String),
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "database error: {e}"),
            StoreError::Migration(e) => write!(f, "migration failed: {e}"),
            StoreError::Corrupt(msg) => write!(f, "corrupt row: {msg}"),
            StoreError::Duplicate(key) => write!(f, "duplicate key: {key}"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            StoreError::Migration(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e)
    }
}

/// Selection criteria for lessons. Unset fields do not constrain.
/// Results come back ordered by appointed time, then id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LessonFilter {
    pub tutor_id: Option<Ulid>,
    pub statuses: Vec<LessonStatus>,
    /// Inclusive lower bound on `appointed_at`.
    pub starts_at_or_after: Option<Ms>,
    /// Exclusive upper bound on `appointed_at`.
    pub starts_before: Option<Ms>,
    pub subject_name: Option<String>,
    pub grade: Option<String>,
    pub level: Option<String>,
    pub enrolled_tutee: Option<String>,
    pub not_enrolled_tutee: Option<String>,
    pub has_enrollments: Option<bool>,
    /// Only lessons with fewer enrollments than this many seats.
    pub seats_below: Option<u32>,
}

impl LessonFilter {
    pub fn with_status(status: LessonStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    pub(crate) fn matches_lesson(&self, lesson: &Lesson) -> bool {
        if self.tutor_id.is_some_and(|t| t != lesson.tutor_id) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&lesson.status) {
            return false;
        }
        if self.starts_at_or_after.is_some_and(|t| lesson.appointed_at < t) {
            return false;
        }
        if self.starts_before.is_some_and(|t| lesson.appointed_at >= t) {
            return false;
        }
        if self.subject_name.as_ref().is_some_and(|s| *s != lesson.subject_name)
            || self.grade.as_ref().is_some_and(|g| *g != lesson.grade)
            || self.level.as_ref().is_some_and(|l| *l != lesson.level)
        {
            return false;
        }
        true
    }
}

pub type Tx = Box<dyn StoreTx>;

/// A handle to the shared store. Reads here take no locks and may be stale.
#[async_trait]
pub trait SchedulingStore: Send + Sync {
    async fn begin(&self) -> Result<Tx, StoreError>;

    async fn find_tutor_by_user(&self, user_id: &str) -> Result<Option<Tutor>, StoreError>;

    async fn find_tutors(&self, ids: &[Ulid]) -> Result<Vec<Tutor>, StoreError>;

    async fn find_lesson(&self, id: Ulid) -> Result<Option<Lesson>, StoreError>;

    async fn find_lessons(&self, filter: &LessonFilter) -> Result<Vec<Lesson>, StoreError>;

    async fn count_lessons(&self, filter: &LessonFilter) -> Result<u64, StoreError>;

    /// Enrollments of the given lessons, oldest sign-up first within a lesson.
    async fn find_enrollments(&self, lesson_ids: &[Ulid]) -> Result<Vec<Enrollment>, StoreError>;
}

/// One open transaction. Locks taken here are held until commit or rollback;
/// dropping the transaction without committing rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    /// Fetch the tutor for `user_id`, creating it if absent, and lock its row.
    async fn lock_tutor(&mut self, user_id: &str, full_name: &str) -> Result<Tutor, StoreError>;

    /// Serialize all transactions that count or change this tutee's sign-ups.
    async fn lock_tutee(&mut self, user_id: &str) -> Result<(), StoreError>;

    async fn lock_lesson(&mut self, id: Ulid) -> Result<Option<Lesson>, StoreError>;

    async fn lock_enrollments(&mut self, lesson_id: Ulid) -> Result<Vec<Enrollment>, StoreError>;

    async fn tutor_by_id(&mut self, id: Ulid) -> Result<Option<Tutor>, StoreError>;

    async fn find_lessons(&mut self, filter: &LessonFilter) -> Result<Vec<Lesson>, StoreError>;

    async fn count_lessons(&mut self, filter: &LessonFilter) -> Result<u64, StoreError>;

    async fn insert_lesson(&mut self, lesson: &Lesson) -> Result<(), StoreError>;

    async fn update_lesson(&mut self, lesson: &Lesson) -> Result<(), StoreError>;

    async fn insert_enrollment(&mut self, enrollment: &Enrollment) -> Result<(), StoreError>;

    async fn update_enrollment(&mut self, enrollment: &Enrollment) -> Result<(), StoreError>;

    /// Returns whether a row was removed.
    async fn delete_enrollment(&mut self, lesson_id: Ulid, tutee_user_id: &str) -> Result<bool, StoreError>;

    /// Remove every enrollment of a lesson; returns how many went.
    async fn delete_enrollments(&mut self, lesson_id: Ulid) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

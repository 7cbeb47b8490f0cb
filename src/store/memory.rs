use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::{LessonFilter, SchedulingStore, StoreError, StoreTx, Tx};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Tutor(String),
    Tutee(String),
    Lesson(Ulid),
    Enrollments(Ulid),
}

#[derive(Debug, Clone, Default)]
struct Tables {
    tutors: BTreeMap<Ulid, Tutor>,
    lessons: BTreeMap<Ulid, Lesson>,
    /// Keyed `(lesson_id, tutee_user_id)`, so one lesson's rows are contiguous.
    enrollments: BTreeMap<(Ulid, String), Enrollment>,
}

impl Tables {
    fn tutor_by_user(&self, user_id: &str) -> Option<&Tutor> {
        self.tutors.values().find(|t| t.user_id == user_id)
    }

    fn enrollments_of(&self, lesson_id: Ulid) -> impl Iterator<Item = &Enrollment> {
        self.enrollments
            .range((lesson_id, String::new())..)
            .take_while(move |((l, _), _)| *l == lesson_id)
            .map(|(_, e)| e)
    }

    fn sorted_enrollments_of(&self, lesson_id: Ulid) -> Vec<Enrollment> {
        let mut rows: Vec<Enrollment> = self.enrollments_of(lesson_id).cloned().collect();
        rows.sort_by_key(|e| e.enrolled_at);
        rows
    }

    fn seats_taken(&self, lesson_id: Ulid) -> u32 {
        self.enrollments_of(lesson_id).count() as u32
    }

    fn is_enrolled(&self, lesson_id: Ulid, tutee_user_id: &str) -> bool {
        self.enrollments
            .contains_key(&(lesson_id, tutee_user_id.to_string()))
    }

    fn matches(&self, filter: &LessonFilter, lesson: &Lesson) -> bool {
        if !filter.matches_lesson(lesson) {
            return false;
        }
        if let Some(tutee) = &filter.enrolled_tutee
            && !self.is_enrolled(lesson.id, tutee)
        {
            return false;
        }
        if let Some(tutee) = &filter.not_enrolled_tutee
            && self.is_enrolled(lesson.id, tutee)
        {
            return false;
        }
        if let Some(want) = filter.has_enrollments
            && (self.seats_taken(lesson.id) > 0) != want
        {
            return false;
        }
        if let Some(seats) = filter.seats_below
            && self.seats_taken(lesson.id) >= seats
        {
            return false;
        }
        true
    }

    fn select(&self, filter: &LessonFilter) -> Vec<Lesson> {
        let mut hits: Vec<Lesson> = self
            .lessons
            .values()
            .filter(|l| self.matches(filter, l))
            .cloned()
            .collect();
        hits.sort_by_key(|l| (l.appointed_at, l.id));
        hits
    }

    fn count(&self, filter: &LessonFilter) -> u64 {
        self.lessons
            .values()
            .filter(|l| self.matches(filter, l))
            .count() as u64
    }
}

/// A row change staged by a transaction, replayed onto the shared tables on commit.
#[derive(Debug, Clone)]
enum Mutation {
    TutorCreated(Tutor),
    LessonInserted(Lesson),
    LessonUpdated(Lesson),
    EnrollmentInserted(Enrollment),
    EnrollmentUpdated(Enrollment),
    EnrollmentDeleted { lesson_id: Ulid, tutee_user_id: String },
    EnrollmentsCleared { lesson_id: Ulid },
}

/// Unique-key checks against committed state, run before anything is applied.
fn check_unique(tables: &Tables, m: &Mutation) -> Result<(), StoreError> {
    match m {
        Mutation::TutorCreated(t) if tables.tutor_by_user(&t.user_id).is_some() => {
            Err(StoreError::Duplicate(format!("tutor user {}", t.user_id)))
        }
        Mutation::LessonInserted(l) if tables.lessons.contains_key(&l.id) => {
            Err(StoreError::Duplicate(format!("lesson {}", l.id)))
        }
        Mutation::EnrollmentInserted(e) if tables.is_enrolled(e.lesson_id, &e.tutee_user_id) => {
            Err(StoreError::Duplicate(format!(
                "enrollment ({}, {})",
                e.lesson_id, e.tutee_user_id
            )))
        }
        _ => Ok(()),
    }
}

fn apply(tables: &mut Tables, m: &Mutation) {
    match m {
        Mutation::TutorCreated(t) => {
            tables.tutors.insert(t.id, t.clone());
        }
        Mutation::LessonInserted(l) | Mutation::LessonUpdated(l) => {
            tables.lessons.insert(l.id, l.clone());
        }
        Mutation::EnrollmentInserted(e) | Mutation::EnrollmentUpdated(e) => {
            tables
                .enrollments
                .insert((e.lesson_id, e.tutee_user_id.clone()), e.clone());
        }
        Mutation::EnrollmentDeleted {
            lesson_id,
            tutee_user_id,
        } => {
            tables
                .enrollments
                .remove(&(*lesson_id, tutee_user_id.clone()));
        }
        Mutation::EnrollmentsCleared { lesson_id } => {
            tables.enrollments.retain(|(l, _), _| l != lesson_id);
        }
    }
}

#[derive(Default)]
struct Shared {
    tables: RwLock<Tables>,
    row_locks: DashMap<RowKey, Arc<Mutex<()>>>,
    fail_next_commit: AtomicBool,
    fail_next_read: AtomicBool,
}

/// Process-local store with the same isolation the engine expects from a
/// database: row locks held to end of transaction, read-committed refresh on
/// every lock acquisition, writes invisible to others until commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next commit fail as a lost connection would. For fault-injection tests.
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make the next unlocked lesson read fail.
    pub fn fail_next_read(&self) {
        self.shared.fail_next_read.store(true, Ordering::SeqCst);
    }

    fn take_read_failure(&self) -> Result<(), StoreError> {
        if self.shared.fail_next_read.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        Ok(())
    }

    pub async fn lesson_count(&self) -> usize {
        self.shared.tables.read().await.lessons.len()
    }

    pub async fn enrollment_count(&self) -> usize {
        self.shared.tables.read().await.enrollments.len()
    }
}

#[async_trait]
impl SchedulingStore for MemoryStore {
    async fn begin(&self) -> Result<Tx, StoreError> {
        let view = self.shared.tables.read().await.clone();
        Ok(Box::new(MemoryTx {
            shared: self.shared.clone(),
            view,
            journal: Vec::new(),
            held: HashMap::new(),
        }))
    }

    async fn find_tutor_by_user(&self, user_id: &str) -> Result<Option<Tutor>, StoreError> {
        Ok(self.shared.tables.read().await.tutor_by_user(user_id).cloned())
    }

    async fn find_tutors(&self, ids: &[Ulid]) -> Result<Vec<Tutor>, StoreError> {
        let tables = self.shared.tables.read().await;
        Ok(ids.iter().filter_map(|id| tables.tutors.get(id).cloned()).collect())
    }

    async fn find_lesson(&self, id: Ulid) -> Result<Option<Lesson>, StoreError> {
        Ok(self.shared.tables.read().await.lessons.get(&id).cloned())
    }

    async fn find_lessons(&self, filter: &LessonFilter) -> Result<Vec<Lesson>, StoreError> {
        self.take_read_failure()?;
        Ok(self.shared.tables.read().await.select(filter))
    }

    async fn count_lessons(&self, filter: &LessonFilter) -> Result<u64, StoreError> {
        self.take_read_failure()?;
        Ok(self.shared.tables.read().await.count(filter))
    }

    async fn find_enrollments(&self, lesson_ids: &[Ulid]) -> Result<Vec<Enrollment>, StoreError> {
        let tables = self.shared.tables.read().await;
        Ok(lesson_ids
            .iter()
            .flat_map(|id| tables.sorted_enrollments_of(*id))
            .collect())
    }
}

struct MemoryTx {
    shared: Arc<Shared>,
    /// Committed state as of the last lock acquisition, plus this transaction's own writes.
    view: Tables,
    journal: Vec<Mutation>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl MemoryTx {
    async fn acquire(&mut self, key: RowKey) {
        if self.held.contains_key(&key) {
            return;
        }
        let lock = self.shared.row_locks.entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        self.held.insert(key, guard);
        self.refresh().await;
    }

    async fn refresh(&mut self) {
        let mut view = self.shared.tables.read().await.clone();
        for m in &self.journal {
            apply(&mut view, m);
        }
        self.view = view;
    }

    fn stage(&mut self, m: Mutation) {
        apply(&mut self.view, &m);
        self.journal.push(m);
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_tutor(&mut self, user_id: &str, full_name: &str) -> Result<Tutor, StoreError> {
        self.acquire(RowKey::Tutor(user_id.to_string())).await;
        if let Some(tutor) = self.view.tutor_by_user(user_id) {
            return Ok(tutor.clone());
        }
        let tutor = Tutor {
            id: Ulid::new(),
            user_id: user_id.to_string(),
            full_name: full_name.to_string(),
        };
        self.stage(Mutation::TutorCreated(tutor.clone()));
        Ok(tutor)
    }

    async fn lock_tutee(&mut self, user_id: &str) -> Result<(), StoreError> {
        self.acquire(RowKey::Tutee(user_id.to_string())).await;
        Ok(())
    }

    async fn lock_lesson(&mut self, id: Ulid) -> Result<Option<Lesson>, StoreError> {
        self.acquire(RowKey::Lesson(id)).await;
        Ok(self.view.lessons.get(&id).cloned())
    }

    async fn lock_enrollments(&mut self, lesson_id: Ulid) -> Result<Vec<Enrollment>, StoreError> {
        self.acquire(RowKey::Enrollments(lesson_id)).await;
        Ok(self.view.sorted_enrollments_of(lesson_id))
    }

    async fn tutor_by_id(&mut self, id: Ulid) -> Result<Option<Tutor>, StoreError> {
        Ok(self.view.tutors.get(&id).cloned())
    }

    async fn find_lessons(&mut self, filter: &LessonFilter) -> Result<Vec<Lesson>, StoreError> {
        Ok(self.view.select(filter))
    }

    async fn count_lessons(&mut self, filter: &LessonFilter) -> Result<u64, StoreError> {
        Ok(self.view.count(filter))
    }

    async fn insert_lesson(&mut self, lesson: &Lesson) -> Result<(), StoreError> {
        if self.view.lessons.contains_key(&lesson.id) {
            return Err(StoreError::Duplicate(format!("lesson {}", lesson.id)));
        }
        self.stage(Mutation::LessonInserted(lesson.clone()));
        Ok(())
    }

    async fn update_lesson(&mut self, lesson: &Lesson) -> Result<(), StoreError> {
        if !self.view.lessons.contains_key(&lesson.id) {
            return Err(StoreError::Corrupt(format!("update of missing lesson {}", lesson.id)));
        }
        self.stage(Mutation::LessonUpdated(lesson.clone()));
        Ok(())
    }

    async fn insert_enrollment(&mut self, enrollment: &Enrollment) -> Result<(), StoreError> {
        if self
            .view
            .is_enrolled(enrollment.lesson_id, &enrollment.tutee_user_id)
        {
            return Err(StoreError::Duplicate(format!(
                "enrollment ({}, {})",
                enrollment.lesson_id, enrollment.tutee_user_id
            )));
        }
        self.stage(Mutation::EnrollmentInserted(enrollment.clone()));
        Ok(())
    }

    async fn update_enrollment(&mut self, enrollment: &Enrollment) -> Result<(), StoreError> {
        if !self
            .view
            .is_enrolled(enrollment.lesson_id, &enrollment.tutee_user_id)
        {
            return Err(StoreError::Corrupt(format!(
                "update of missing enrollment ({}, {})",
                enrollment.lesson_id, enrollment.tutee_user_id
            )));
        }
        self.stage(Mutation::EnrollmentUpdated(enrollment.clone()));
        Ok(())
    }

    async fn delete_enrollment(&mut self, lesson_id: Ulid, tutee_user_id: &str) -> Result<bool, StoreError> {
        if !self.view.is_enrolled(lesson_id, tutee_user_id) {
            return Ok(false);
        }
        self.stage(Mutation::EnrollmentDeleted {
            lesson_id,
            tutee_user_id: tutee_user_id.to_string(),
        });
        Ok(true)
    }

    async fn delete_enrollments(&mut self, lesson_id: Ulid) -> Result<u64, StoreError> {
        let removed = self.view.seats_taken(lesson_id) as u64;
        self.stage(Mutation::EnrollmentsCleared { lesson_id });
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection lost during commit".into()));
        }
        let mut tables = self.shared.tables.write().await;
        for m in &self.journal {
            check_unique(&tables, m)?;
        }
        for m in &self.journal {
            apply(&mut tables, m);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

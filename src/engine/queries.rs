use std::collections::HashMap;
use std::str::FromStr;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::LessonFilter;

use super::{Engine, EngineError};

impl FromStr for TutorLessonCategory {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upcoming" => Ok(TutorLessonCategory::Upcoming),
            "summaryPending" => Ok(TutorLessonCategory::SummaryPending),
            other => Err(EngineError::InvalidLessonCategory(other.to_string())),
        }
    }
}

impl FromStr for TuteeLessonCategory {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upcoming" => Ok(TuteeLessonCategory::Upcoming),
            "reviewPending" => Ok(TuteeLessonCategory::ReviewPending),
            other => Err(EngineError::InvalidLessonCategory(other.to_string())),
        }
    }
}

/// Which enrollment rows a listing carries alongside each lesson.
enum EnrollmentView {
    All,
    OnlyTutee(String),
    CountOnly,
}

impl Engine {
    pub async fn lessons_of_tutor(
        &self,
        tutor_user_id: &str,
        category: TutorLessonCategory,
    ) -> Result<Vec<LessonDetail>, EngineError> {
        self.observed("lessons_of_tutor", async {
            let Some(tutor) = self.store.find_tutor_by_user(tutor_user_id).await? else {
                return Ok(Vec::new());
            };
            let now = self.now();
            let filter = match category {
                TutorLessonCategory::Upcoming => LessonFilter {
                    tutor_id: Some(tutor.id),
                    starts_at_or_after: Some(now),
                    ..LessonFilter::with_status(LessonStatus::Created)
                },
                TutorLessonCategory::SummaryPending => LessonFilter {
                    tutor_id: Some(tutor.id),
                    starts_before: Some(now - LESSON_DURATION_MS),
                    has_enrollments: Some(true),
                    ..LessonFilter::with_status(LessonStatus::Created)
                },
            };
            let lessons = self.store.find_lessons(&filter).await?;
            self.details(lessons, EnrollmentView::All).await
        })
        .await
    }

    /// Lessons the tutor has had approved.
    pub async fn approved_lesson_count(&self, tutor_user_id: &str) -> Result<u64, EngineError> {
        self.observed("approved_lesson_count", async {
            let Some(tutor) = self.store.find_tutor_by_user(tutor_user_id).await? else {
                return Ok(0);
            };
            let filter = LessonFilter {
                tutor_id: Some(tutor.id),
                ..LessonFilter::with_status(LessonStatus::Approved)
            };
            Ok(self.store.count_lessons(&filter).await?)
        })
        .await
    }

    /// Open future lessons matching subject, grade and level that still have
    /// a free seat and that the tutee has not joined.
    pub async fn search_available_lessons(
        &self,
        search: &LessonSearch,
        tutee_user_id: &str,
    ) -> Result<Vec<LessonDetail>, EngineError> {
        self.observed("search_available_lessons", async {
            let filter = LessonFilter {
                starts_at_or_after: Some(self.now()),
                subject_name: Some(search.subject_name.clone()),
                grade: Some(search.grade.clone()),
                level: Some(search.level.clone()),
                not_enrolled_tutee: Some(tutee_user_id.to_string()),
                seats_below: Some(MAX_TUTEES_PER_LESSON),
                ..LessonFilter::with_status(LessonStatus::Created)
            };
            let lessons = self.store.find_lessons(&filter).await?;
            self.details(lessons, EnrollmentView::CountOnly).await
        })
        .await
    }

    pub async fn lessons_of_tutee(
        &self,
        tutee_user_id: &str,
        category: TuteeLessonCategory,
    ) -> Result<Vec<LessonDetail>, EngineError> {
        self.observed("lessons_of_tutee", async {
            let now = self.now();
            let enrolled = LessonFilter {
                enrolled_tutee: Some(tutee_user_id.to_string()),
                ..LessonFilter::with_status(LessonStatus::Created)
            };
            let filter = match category {
                TuteeLessonCategory::Upcoming => LessonFilter {
                    starts_at_or_after: Some(now),
                    ..enrolled
                },
                TuteeLessonCategory::ReviewPending => LessonFilter {
                    starts_at_or_after: Some(now - REVIEW_WINDOW_MS),
                    starts_before: Some(now - LESSON_DURATION_MS),
                    ..enrolled
                },
            };
            let lessons = self.store.find_lessons(&filter).await?;
            self.details(lessons, EnrollmentView::OnlyTutee(tutee_user_id.to_string()))
                .await
        })
        .await
    }

    /// Reported lessons waiting for an admin verdict.
    pub async fn verdict_pending_lessons(&self) -> Result<Vec<LessonDetail>, EngineError> {
        self.observed("verdict_pending_lessons", async {
            let filter = LessonFilter {
                statuses: vec![LessonStatus::Completed, LessonStatus::Unattended],
                ..LessonFilter::default()
            };
            let lessons = self.store.find_lessons(&filter).await?;
            self.details(lessons, EnrollmentView::All).await
        })
        .await
    }

    /// Attach tutor names and enrollments in two batched reads.
    async fn details(&self, lessons: Vec<Lesson>, view: EnrollmentView) -> Result<Vec<LessonDetail>, EngineError> {
        if lessons.is_empty() {
            return Ok(Vec::new());
        }

        let lesson_ids: Vec<Ulid> = lessons.iter().map(|l| l.id).collect();
        let mut tutor_ids: Vec<Ulid> = lessons.iter().map(|l| l.tutor_id).collect();
        tutor_ids.sort();
        tutor_ids.dedup();

        let tutors: HashMap<Ulid, String> = self
            .store
            .find_tutors(&tutor_ids)
            .await?
            .into_iter()
            .map(|t| (t.id, t.full_name))
            .collect();

        let mut by_lesson: HashMap<Ulid, Vec<Enrollment>> = HashMap::new();
        for e in self.store.find_enrollments(&lesson_ids).await? {
            by_lesson.entry(e.lesson_id).or_default().push(e);
        }

        Ok(lessons
            .into_iter()
            .map(|lesson| {
                let all = by_lesson.remove(&lesson.id).unwrap_or_default();
                let seats_taken = all.len() as u32;
                let enrollments = match &view {
                    EnrollmentView::All => all,
                    EnrollmentView::OnlyTutee(user) => {
                        all.into_iter().filter(|e| &e.tutee_user_id == user).collect()
                    }
                    EnrollmentView::CountOnly => Vec::new(),
                };
                LessonDetail {
                    tutor_full_name: tutors.get(&lesson.tutor_id).cloned().unwrap_or_default(),
                    lesson,
                    seats_taken,
                    enrollments,
                }
            })
            .collect())
    }
}

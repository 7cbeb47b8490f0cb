use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::LessonEvent;
use crate::store::LessonFilter;

use super::conflict::{check_lead_time, check_open_for_signup, check_reviewable};
use super::{Engine, EngineError, Entity, detail_in_tx};

impl Engine {
    /// Take a seat in an open lesson.
    ///
    /// Locks are taken lesson first, then the tutee, then the lesson's
    /// enrollment set. The tutee lock serializes sign-ups by one tutee across
    /// different lessons, which the lesson lock alone does not cover.
    pub async fn enroll_to_lesson(&self, lesson_id: Ulid, tutee: &Identity) -> Result<Enrolled, EngineError> {
        let now = self.now();
        let tutee = tutee.clone();

        let enrolled = self
            .with_locked_lesson("enroll_to_lesson", lesson_id, move |tx, lesson| {
                Box::pin(async move {
                    check_open_for_signup(&lesson, now)?;

                    tx.lock_tutee(&tutee.user_id).await?;
                    let signed_up = tx
                        .count_lessons(&LessonFilter {
                            starts_at_or_after: Some(now),
                            enrolled_tutee: Some(tutee.user_id.clone()),
                            ..LessonFilter::with_status(LessonStatus::Created)
                        })
                        .await?;
                    if signed_up >= MAX_SIGNEDUP_LESSONS_PER_TUTEE {
                        return Err(EngineError::TuteeLimitReached);
                    }

                    let mut enrollments = tx.lock_enrollments(lesson.id).await?;
                    if enrollments.len() as u32 >= MAX_TUTEES_PER_LESSON {
                        return Err(EngineError::LessonFull);
                    }
                    if enrollments.iter().any(|e| e.tutee_user_id == tutee.user_id) {
                        return Err(EngineError::AlreadySignedUp);
                    }

                    let enrollment = Enrollment::new(lesson.id, &tutee, now);
                    tx.insert_enrollment(&enrollment).await?;
                    enrollments.push(enrollment.clone());

                    let lesson = detail_in_tx(tx, lesson, enrollments).await?;
                    Ok(Enrolled { enrollment, lesson })
                })
            })
            .await?;

        info!(
            lesson_id = %enrolled.lesson.lesson.id,
            tutee = %enrolled.enrollment.tutee_user_id,
            seats_taken = enrolled.lesson.seats_taken,
            "tutee enrolled"
        );
        Ok(enrolled)
    }

    /// Give up a seat. Closes at the same lead time as cancel; the tutor
    /// hears about it through the event hook.
    pub async fn withdraw_from_lesson(&self, lesson_id: Ulid, tutee_user_id: &str) -> Result<LessonDetail, EngineError> {
        let now = self.now();
        let tutee = tutee_user_id.to_string();

        let (detail, event) = self
            .with_locked_lesson("withdraw_from_lesson", lesson_id, move |tx, lesson| {
                Box::pin(async move {
                    let mut enrollments = tx.lock_enrollments(lesson.id).await?;
                    let Some(pos) = enrollments.iter().position(|e| e.tutee_user_id == tutee) else {
                        return Err(EngineError::NotFound(Entity::Enrollment, tutee));
                    };
                    if lesson.status != LessonStatus::Created {
                        return Err(EngineError::LessonClosed);
                    }
                    check_lead_time(&lesson, now)?;

                    tx.delete_enrollment(lesson.id, &tutee).await?;
                    enrollments.remove(pos);

                    let detail = detail_in_tx(tx, lesson, enrollments).await?;
                    let tutor = tx
                        .tutor_by_id(detail.lesson.tutor_id)
                        .await?
                        .ok_or_else(|| EngineError::NotFound(Entity::Tutor, detail.lesson.tutor_id.to_string()))?;
                    let event = LessonEvent::TuteeWithdrew {
                        lesson_id: detail.lesson.id,
                        tutor_id: tutor.id,
                        tutor_user_id: tutor.user_id,
                        tutee_user_id: tutee,
                        subject_name: detail.lesson.subject_name.clone(),
                        appointed_at: detail.lesson.appointed_at,
                    };
                    Ok((detail, event))
                })
            })
            .await?;

        info!(lesson_id = %detail.lesson.id, tutee = %tutee_user_id, "tutee withdrew");
        self.emit(event);
        Ok(detail)
    }

    /// Rate a lesson the tutee sat in. One review per enrollment, inside the
    /// review window.
    pub async fn submit_review(&self, lesson_id: Ulid, tutee_user_id: &str, review: Review) -> Result<Enrollment, EngineError> {
        let now = self.now();
        let tutee = tutee_user_id.to_string();

        let enrollment = self
            .with_locked_lesson("submit_review", lesson_id, move |tx, lesson| {
                Box::pin(async move {
                    let mut enrollment = tx
                        .lock_enrollments(lesson.id)
                        .await?
                        .into_iter()
                        .find(|e| e.tutee_user_id == tutee)
                        .ok_or(EngineError::NotFound(Entity::Enrollment, tutee))?;
                    check_reviewable(&lesson, &enrollment, &review, now)?;

                    enrollment.apply_review(&review);
                    tx.update_enrollment(&enrollment).await?;
                    Ok(enrollment)
                })
            })
            .await?;

        info!(lesson_id = %enrollment.lesson_id, tutee = %enrollment.tutee_user_id, "lesson reviewed");
        Ok(enrollment)
    }
}

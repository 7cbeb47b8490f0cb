use std::collections::HashMap;

use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::LessonEvent;
use crate::store::LessonFilter;

use super::conflict::{check_lead_time, check_no_overlap, check_transition};
use super::{Engine, EngineError, owning_tutor};

impl Engine {
    /// Schedule a new lesson. The tutor row is created on first use and
    /// stays locked until commit, so concurrent creates for one tutor run
    /// one at a time.
    pub async fn create_lesson(&self, tutor: &Identity, new: NewLesson) -> Result<Lesson, EngineError> {
        let now = self.now();
        let user_id = tutor.user_id.clone();
        let full_name = tutor.full_name.clone();

        let lesson = self
            .in_tx("create_lesson", move |tx| {
                Box::pin(async move {
                    let tutor = tx.lock_tutor(&user_id, &full_name).await?;

                    let open = tx
                        .count_lessons(&LessonFilter {
                            tutor_id: Some(tutor.id),
                            starts_at_or_after: Some(now),
                            ..LessonFilter::with_status(LessonStatus::Created)
                        })
                        .await?;
                    if open >= MAX_OPEN_LESSONS_PER_TUTOR {
                        return Err(EngineError::LessonLimitReached);
                    }

                    let nearby = tx
                        .find_lessons(&LessonFilter {
                            tutor_id: Some(tutor.id),
                            starts_at_or_after: Some(new.appointed_at - OVERLAP_WINDOW_MS),
                            starts_before: Some(new.appointed_at + OVERLAP_WINDOW_MS + 1),
                            ..LessonFilter::with_status(LessonStatus::Created)
                        })
                        .await?;
                    check_no_overlap(&nearby, new.appointed_at)?;

                    let lesson = Lesson {
                        id: Ulid::new(),
                        tutor_id: tutor.id,
                        subject_name: new.subject_name,
                        grade: new.grade,
                        level: new.level,
                        description: new.description,
                        appointed_at: new.appointed_at,
                        format: new.format,
                        location_or_link: new.location_or_link,
                        status: LessonStatus::Created,
                        summary: None,
                    };
                    tx.insert_lesson(&lesson).await?;
                    Ok(lesson)
                })
            })
            .await?;

        info!(lesson_id = %lesson.id, tutor = %tutor.user_id, appointed_at = lesson.appointed_at, "lesson created");
        Ok(lesson)
    }

    /// Cancel an open lesson and drop every sign-up on it. Affected tutees
    /// are told through the event hook once the cancel is durable.
    pub async fn cancel_lesson(&self, lesson_id: Ulid, tutor_user_id: &str) -> Result<CanceledLesson, EngineError> {
        let now = self.now();
        let caller = tutor_user_id.to_string();

        let canceled = self
            .in_tx_mapped("cancel_lesson", EngineError::CancelFailed, move |tx| {
                Box::pin(async move {
                    let mut lesson = tx
                        .lock_lesson(lesson_id)
                        .await?
                        .ok_or_else(|| EngineError::lesson_not_found(lesson_id))?;
                    owning_tutor(tx, &lesson, &caller).await?;
                    check_transition(&lesson, LessonStatus::Canceled)?;
                    check_lead_time(&lesson, now)?;

                    let enrollments = tx.lock_enrollments(lesson.id).await?;
                    lesson.status = LessonStatus::Canceled;
                    tx.update_lesson(&lesson).await?;
                    let affected_tutee_ids: Vec<String> =
                        enrollments.into_iter().map(|e| e.tutee_user_id).collect();
                    tx.delete_enrollments(lesson.id).await?;

                    Ok(CanceledLesson {
                        lesson,
                        affected_tutee_ids,
                    })
                })
            })
            .await?;

        info!(
            lesson_id = %canceled.lesson.id,
            affected = canceled.affected_tutee_ids.len(),
            "lesson canceled"
        );
        self.emit(LessonEvent::LessonCanceled {
            lesson_id: canceled.lesson.id,
            tutor_user_id: tutor_user_id.to_string(),
            affected_tutee_ids: canceled.affected_tutee_ids.clone(),
            subject_name: canceled.lesson.subject_name.clone(),
            appointed_at: canceled.lesson.appointed_at,
        });
        Ok(canceled)
    }

    /// Partial update of the free-form fields. Allowed until the lesson
    /// reaches a terminal status.
    pub async fn edit_lesson(&self, lesson_id: Ulid, tutor_user_id: &str, edit: LessonEdit) -> Result<Lesson, EngineError> {
        let caller = tutor_user_id.to_string();
        let lesson = self
            .with_locked_lesson("edit_lesson", lesson_id, move |tx, mut lesson| {
                Box::pin(async move {
                    owning_tutor(tx, &lesson, &caller).await?;
                    if lesson.status.is_terminal() {
                        return Err(EngineError::InvalidStatusUpdate {
                            from: lesson.status,
                            to: lesson.status,
                        });
                    }

                    if let Some(description) = edit.description {
                        lesson.description = description;
                    }
                    if let Some(format) = edit.format {
                        lesson.format = format;
                    }
                    if let Some(location) = edit.location_or_link {
                        lesson.location_or_link = Some(location);
                    }
                    tx.update_lesson(&lesson).await?;
                    Ok(lesson)
                })
            })
            .await?;

        info!(lesson_id = %lesson.id, "lesson edited");
        Ok(lesson)
    }

    /// Close out a lesson that has ended: store the summary, mark who came,
    /// and move it to `completed` (anyone present) or `unattended`.
    pub async fn upload_lesson_report(
        &self,
        lesson_id: Ulid,
        tutor_user_id: &str,
        summary: String,
        presence: Vec<TuteePresence>,
    ) -> Result<LessonDetail, EngineError> {
        let now = self.now();
        let caller = tutor_user_id.to_string();

        let detail = self
            .with_locked_lesson("upload_lesson_report", lesson_id, move |tx, mut lesson| {
                Box::pin(async move {
                    let tutor = owning_tutor(tx, &lesson, &caller).await?;
                    check_transition(&lesson, LessonStatus::Completed)?;
                    if !has_ended(lesson.appointed_at, now) {
                        return Err(EngineError::LessonNotEnded);
                    }

                    let mut enrollments = tx.lock_enrollments(lesson.id).await?;
                    let marks = match_presence(&enrollments, &presence)?;

                    lesson.summary = Some(summary);
                    lesson.status = if marks.values().any(|present| *present) {
                        LessonStatus::Completed
                    } else {
                        LessonStatus::Unattended
                    };
                    tx.update_lesson(&lesson).await?;

                    for enrollment in &mut enrollments {
                        enrollment.presence = marks.get(&enrollment.tutee_user_id).copied();
                        tx.update_enrollment(enrollment).await?;
                    }

                    Ok(LessonDetail {
                        lesson,
                        tutor_full_name: tutor.full_name,
                        seats_taken: enrollments.len() as u32,
                        enrollments,
                    })
                })
            })
            .await?;

        info!(lesson_id = %detail.lesson.id, status = %detail.lesson.status, "lesson report uploaded");
        Ok(detail)
    }

    /// Admin approval of a reported lesson.
    pub async fn update_lesson_verdict(&self, lesson_id: Ulid, is_approved: bool) -> Result<Lesson, EngineError> {
        let next = if is_approved {
            LessonStatus::Approved
        } else {
            LessonStatus::NotApproved
        };

        let lesson = self
            .with_locked_lesson("update_lesson_verdict", lesson_id, move |tx, mut lesson| {
                Box::pin(async move {
                    check_transition(&lesson, next)?;
                    lesson.status = next;
                    tx.update_lesson(&lesson).await?;
                    Ok(lesson)
                })
            })
            .await?;

        info!(lesson_id = %lesson.id, status = %lesson.status, "lesson verdict recorded");
        Ok(lesson)
    }
}

/// Presence list must name each enrolled tutee exactly once.
fn match_presence(enrollments: &[Enrollment], presence: &[TuteePresence]) -> Result<HashMap<String, bool>, EngineError> {
    let mut marks = HashMap::with_capacity(presence.len());
    for p in presence {
        let enrolled = enrollments.iter().any(|e| e.tutee_user_id == p.tutee_user_id);
        if !enrolled || marks.insert(p.tutee_user_id.clone(), p.present).is_some() {
            return Err(EngineError::InvalidTutee(p.tutee_user_id.clone()));
        }
    }
    if let Some(missing) = enrollments.iter().find(|e| !marks.contains_key(&e.tutee_user_id)) {
        return Err(EngineError::MissingPresenceInfo(missing.tutee_user_id.clone()));
    }
    Ok(marks)
}

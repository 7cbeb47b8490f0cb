use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// First open lesson starting within the overlap window of `appointed_at`.
/// Both window edges count as overlapping.
pub fn find_overlap(open_lessons: &[Lesson], appointed_at: Ms) -> Option<&Lesson> {
    open_lessons.iter().find(|l| {
        l.status == LessonStatus::Created && (l.appointed_at - appointed_at).abs() <= OVERLAP_WINDOW_MS
    })
}

pub(crate) fn check_no_overlap(open_lessons: &[Lesson], appointed_at: Ms) -> Result<(), EngineError> {
    match find_overlap(open_lessons, appointed_at) {
        Some(existing) => Err(EngineError::OverlappingLesson(existing.id)),
        None => Ok(()),
    }
}

pub(crate) fn check_transition(lesson: &Lesson, next: LessonStatus) -> Result<(), EngineError> {
    if lesson.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(EngineError::InvalidStatusUpdate {
            from: lesson.status,
            to: next,
        })
    }
}

/// Cancel and withdraw close this long before the lesson starts.
pub(crate) fn check_lead_time(lesson: &Lesson, now: Ms) -> Result<(), EngineError> {
    if !outside_lead_time(lesson.appointed_at, now) {
        return Err(EngineError::LeadTimePassed);
    }
    Ok(())
}

pub(crate) fn check_open_for_signup(lesson: &Lesson, now: Ms) -> Result<(), EngineError> {
    if lesson.status != LessonStatus::Created || lesson.appointed_at < now {
        return Err(EngineError::LessonClosed);
    }
    Ok(())
}

pub(crate) fn check_reviewable(lesson: &Lesson, enrollment: &Enrollment, review: &Review, now: Ms) -> Result<(), EngineError> {
    if !within_review_window(lesson.appointed_at, now) {
        return Err(EngineError::ReviewWindowClosed);
    }
    if enrollment.is_reviewed() {
        return Err(EngineError::AlreadyReviewed);
    }
    if !review.ratings().into_iter().all(rating_in_range) {
        return Err(EngineError::InvalidReview("ratings must be between 1 and 5"));
    }
    Ok(())
}

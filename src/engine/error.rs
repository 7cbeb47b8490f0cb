use serde::Serialize;
use ulid::Ulid;

use crate::model::LessonStatus;
use crate::store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Lesson,
    Tutor,
    Enrollment,
}

impl Entity {
    fn as_str(self) -> &'static str {
        match self {
            Entity::Lesson => "lesson",
            Entity::Tutor => "tutor",
            Entity::Enrollment => "enrollment",
        }
    }
}

/// HTTP-like class an outer layer maps each error onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    BadRequest,
    Forbidden,
    NotFound,
    Conflict,
    Internal,
}

impl StatusClass {
    pub fn http_status(self) -> u16 {
        match self {
            StatusClass::BadRequest => 400,
            StatusClass::Forbidden => 403,
            StatusClass::NotFound => 404,
            StatusClass::Conflict => 409,
            StatusClass::Internal => 500,
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Entity, String),
    Unauthorized,
    LessonLimitReached,
    OverlappingLesson(Ulid),
    LessonFull,
    TuteeLimitReached,
    AlreadySignedUp,
    InvalidStatusUpdate { from: LessonStatus, to: LessonStatus },
    InvalidLessonCategory(String),
    InvalidTutee(String),
    MissingPresenceInfo(String),
    LeadTimePassed,
    LessonNotEnded,
    LessonClosed,
    ReviewWindowClosed,
    AlreadyReviewed,
    InvalidReview(&'static str),
    CancelFailed(StoreError),
    Storage(StoreError),
}

impl EngineError {
    pub(crate) fn lesson_not_found(id: Ulid) -> Self {
        EngineError::NotFound(Entity::Lesson, id.to_string())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) => "NOT_FOUND",
            EngineError::Unauthorized => "UNAUTHORIZED",
            EngineError::LessonLimitReached => "LESSON_LIMIT_REACHED",
            EngineError::OverlappingLesson(_) => "OVERLAPPING_LESSON",
            EngineError::LessonFull => "LESSON_FULL",
            EngineError::TuteeLimitReached => "TUTEE_LIMIT_REACHED",
            EngineError::AlreadySignedUp => "ALREADY_SIGNED_UP",
            EngineError::InvalidStatusUpdate { .. } => "INVALID_STATUS_UPDATE",
            EngineError::InvalidLessonCategory(_) => "INVALID_LESSON_CATEGORY",
            EngineError::InvalidTutee(_) => "INVALID_TUTEE",
            EngineError::MissingPresenceInfo(_) => "MISSING_PRESENCE_INFO",
            EngineError::LeadTimePassed => "LEAD_TIME_PASSED",
            EngineError::LessonNotEnded => "LESSON_NOT_ENDED",
            EngineError::LessonClosed => "LESSON_CLOSED",
            EngineError::ReviewWindowClosed => "REVIEW_WINDOW_CLOSED",
            EngineError::AlreadyReviewed => "ALREADY_REVIEWED",
            EngineError::InvalidReview(_) => "INVALID_REVIEW",
            EngineError::CancelFailed(_) => "CANCEL_ERROR",
            EngineError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn status(&self) -> StatusClass {
        match self {
            EngineError::NotFound(..) => StatusClass::NotFound,
            EngineError::Unauthorized => StatusClass::Forbidden,
            EngineError::InvalidLessonCategory(_)
            | EngineError::InvalidTutee(_)
            | EngineError::MissingPresenceInfo(_)
            | EngineError::InvalidReview(_) => StatusClass::BadRequest,
            EngineError::LessonLimitReached
            | EngineError::OverlappingLesson(_)
            | EngineError::LessonFull
            | EngineError::TuteeLimitReached
            | EngineError::AlreadySignedUp
            | EngineError::InvalidStatusUpdate { .. }
            | EngineError::LeadTimePassed
            | EngineError::LessonNotEnded
            | EngineError::LessonClosed
            | EngineError::ReviewWindowClosed
            | EngineError::AlreadyReviewed => StatusClass::Conflict,
            EngineError::CancelFailed(_) | EngineError::Storage(_) => StatusClass::Internal,
        }
    }

    /// Business-rule outcomes, as opposed to infrastructure faults a caller may retry.
    pub fn is_rejection(&self) -> bool {
        self.status() != StatusClass::Internal
    }

    pub fn body(&self, origin: &'static str) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            origin,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(entity, id) => write!(f, "{} not found: {id}", entity.as_str()),
            EngineError::Unauthorized => write!(f, "caller does not own this lesson"),
            EngineError::LessonLimitReached => write!(
                f,
                "tutor already has {} open lessons",
                crate::limits::MAX_OPEN_LESSONS_PER_TUTOR
            ),
            EngineError::OverlappingLesson(id) => {
                write!(f, "lesson {id} is scheduled within an hour of this time")
            }
            EngineError::LessonFull => write!(
                f,
                "lesson already has {} tutees",
                crate::limits::MAX_TUTEES_PER_LESSON
            ),
            EngineError::TuteeLimitReached => write!(
                f,
                "tutee is already signed up for {} upcoming lessons",
                crate::limits::MAX_SIGNEDUP_LESSONS_PER_TUTEE
            ),
            EngineError::AlreadySignedUp => write!(f, "tutee is already signed up for this lesson"),
            EngineError::InvalidStatusUpdate { from, to } => {
                write!(f, "lesson status cannot change from {from} to {to}")
            }
            EngineError::InvalidLessonCategory(c) => write!(f, "invalid lesson category: {c}"),
            EngineError::InvalidTutee(t) => write!(f, "tutee {t} is not enrolled in this lesson"),
            EngineError::MissingPresenceInfo(t) => write!(f, "presence missing for tutee {t}"),
            EngineError::LeadTimePassed => write!(f, "lesson starts too soon to change sign-ups"),
            EngineError::LessonNotEnded => write!(f, "lesson has not ended yet"),
            EngineError::LessonClosed => write!(f, "lesson is no longer open for sign-up"),
            EngineError::ReviewWindowClosed => write!(f, "lesson is outside its review window"),
            EngineError::AlreadyReviewed => write!(f, "lesson was already reviewed by this tutee"),
            EngineError::InvalidReview(msg) => write!(f, "invalid review: {msg}"),
            EngineError::CancelFailed(e) => write!(f, "cancel failed: {e}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::CancelFailed(e) | EngineError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Storage(e)
    }
}

/// What an outer layer shows the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub origin: &'static str,
}

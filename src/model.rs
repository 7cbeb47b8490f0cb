use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds; the only time type used.
pub type Ms = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tutor {
    pub id: Ulid,
    /// External identity, unique per tutor.
    pub user_id: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LessonFormat {
    Online,
    InPerson,
}

impl LessonFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            LessonFormat::Online => "online",
            LessonFormat::InPerson => "in-person",
        }
    }
}

impl fmt::Display for LessonFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LessonFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(LessonFormat::Online),
            "in-person" => Ok(LessonFormat::InPerson),
            other => Err(format!("unknown lesson format: {other}")),
        }
    }
}

/// Lesson lifecycle.
///
/// ```text
/// created ──cancel──▶ canceled
///    │
///    └──report──▶ completed | unattended ──verdict──▶ approved | notapproved
/// ```
///
/// `canceled`, `approved` and `notapproved` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LessonStatus {
    Created,
    Canceled,
    Completed,
    Unattended,
    Approved,
    NotApproved,
}

impl LessonStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LessonStatus::Created => "created",
            LessonStatus::Canceled => "canceled",
            LessonStatus::Completed => "completed",
            LessonStatus::Unattended => "unattended",
            LessonStatus::Approved => "approved",
            LessonStatus::NotApproved => "notapproved",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LessonStatus::Canceled | LessonStatus::Approved | LessonStatus::NotApproved
        )
    }

    pub fn can_transition_to(self, next: LessonStatus) -> bool {
        matches!(
            (self, next),
            (
                LessonStatus::Created,
                LessonStatus::Canceled | LessonStatus::Completed | LessonStatus::Unattended
            ) | (
                LessonStatus::Completed | LessonStatus::Unattended,
                LessonStatus::Approved | LessonStatus::NotApproved
            )
        )
    }
}

impl fmt::Display for LessonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LessonStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(LessonStatus::Created),
            "canceled" => Ok(LessonStatus::Canceled),
            "completed" => Ok(LessonStatus::Completed),
            "unattended" => Ok(LessonStatus::Unattended),
            "approved" => Ok(LessonStatus::Approved),
            "notapproved" => Ok(LessonStatus::NotApproved),
            other => Err(format!("unknown lesson status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: Ulid,
    pub tutor_id: Ulid,
    pub subject_name: String,
    pub grade: String,
    pub level: String,
    pub description: String,
    pub appointed_at: Ms,
    pub format: LessonFormat,
    pub location_or_link: Option<String>,
    pub status: LessonStatus,
    pub summary: Option<String>,
}

/// One tutee's seat in one lesson. Tutee name and email are copied in at
/// sign-up time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub lesson_id: Ulid,
    pub tutee_user_id: String,
    pub tutee_full_name: String,
    pub tutee_email: String,
    pub presence: Option<bool>,
    pub clarity: Option<u8>,
    pub understanding: Option<u8>,
    pub focus: Option<u8>,
    pub helpful: Option<u8>,
    pub enrolled_at: Ms,
}

impl Enrollment {
    pub fn new(lesson_id: Ulid, tutee: &Identity, enrolled_at: Ms) -> Self {
        Self {
            lesson_id,
            tutee_user_id: tutee.user_id.clone(),
            tutee_full_name: tutee.full_name.clone(),
            tutee_email: tutee.email.clone(),
            presence: None,
            clarity: None,
            understanding: None,
            focus: None,
            helpful: None,
            enrolled_at,
        }
    }

    pub fn is_reviewed(&self) -> bool {
        self.clarity.is_some()
            || self.understanding.is_some()
            || self.focus.is_some()
            || self.helpful.is_some()
    }

    pub fn apply_review(&mut self, review: &Review) {
        self.clarity = Some(review.clarity);
        self.understanding = Some(review.understanding);
        self.focus = Some(review.focus);
        self.helpful = Some(review.helpful);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub clarity: u8,
    pub understanding: u8,
    pub focus: u8,
    pub helpful: u8,
}

impl Review {
    pub fn ratings(&self) -> [u8; 4] {
        [self.clarity, self.understanding, self.focus, self.helpful]
    }
}

// ── Inputs ───────────────────────────────────────────────────────

/// Caller identity, already verified upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub full_name: String,
    pub email: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, full_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            full_name: full_name.into(),
            email: email.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLesson {
    pub subject_name: String,
    pub grade: String,
    pub level: String,
    pub description: String,
    pub appointed_at: Ms,
    pub format: LessonFormat,
    pub location_or_link: Option<String>,
}

/// Partial update: `None` leaves the field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LessonEdit {
    pub description: Option<String>,
    pub format: Option<LessonFormat>,
    pub location_or_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuteePresence {
    pub tutee_user_id: String,
    pub present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonSearch {
    pub subject_name: String,
    pub grade: String,
    pub level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TutorLessonCategory {
    Upcoming,
    SummaryPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuteeLessonCategory {
    Upcoming,
    ReviewPending,
}

// ── Results ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LessonDetail {
    pub lesson: Lesson,
    pub tutor_full_name: String,
    /// Total enrollments on the lesson, regardless of what `enrollments` holds.
    pub seats_taken: u32,
    /// Depends on the listing: every enrollment for tutor and admin views, the
    /// caller's own row for tutee views, empty for search results.
    pub enrollments: Vec<Enrollment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanceledLesson {
    pub lesson: Lesson,
    pub affected_tutee_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enrolled {
    pub enrollment: Enrollment,
    pub lesson: LessonDetail,
}

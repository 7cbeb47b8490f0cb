//! Capacity and timing policy. Every limit the engine enforces lives here.

use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Seats per lesson.
pub const MAX_TUTEES_PER_LESSON: u32 = 2;

/// Open (`created`, not yet started) lessons a tutor may hold at once.
pub const MAX_OPEN_LESSONS_PER_TUTOR: u64 = 6;

/// Open lessons a tutee may be signed up for at once.
pub const MAX_SIGNEDUP_LESSONS_PER_TUTEE: u64 = 3;

/// Cancel and withdraw are refused once a lesson is this close to starting.
pub const MIN_LEAD_TIME_MS: Ms = 3 * HOUR_MS;

/// Two open lessons of one tutor must start more than this far apart.
pub const OVERLAP_WINDOW_MS: Ms = HOUR_MS;

/// A lesson is considered over this long after its appointed start.
pub const LESSON_DURATION_MS: Ms = HOUR_MS;

/// Reviews are accepted until this long after the appointed start.
pub const REVIEW_WINDOW_MS: Ms = 7 * DAY_MS;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// True while the lesson is still far enough away to cancel or withdraw.
pub fn outside_lead_time(appointed_at: Ms, now: Ms) -> bool {
    appointed_at - now > MIN_LEAD_TIME_MS
}

/// True once the lesson's appointed slot is over.
pub fn has_ended(appointed_at: Ms, now: Ms) -> bool {
    appointed_at < now - LESSON_DURATION_MS
}

/// True while tutees may still rate the lesson.
pub fn within_review_window(appointed_at: Ms, now: Ms) -> bool {
    has_ended(appointed_at, now) && appointed_at >= now - REVIEW_WINDOW_MS
}

pub fn rating_in_range(rating: u8) -> bool {
    (MIN_RATING..=MAX_RATING).contains(&rating)
}

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;
use ulid::Ulid;

use crate::config::Config;
use crate::model::*;

use super::{LessonFilter, SchedulingStore, StoreError, StoreTx, Tx};

const LESSON_COLUMNS: &str = "l.id, l.tutor_id, l.subject_name, l.grade, l.level, l.description, \
     l.appointed_at, l.format, l.location_or_link, l.status, l.summary";

const ENROLLMENT_COLUMNS: &str = "lesson_id, tutee_user_id, tutee_full_name, tutee_email, presence, \
     clarity, understanding, focus, helpful, enrolled_at";

#[derive(sqlx::FromRow)]
struct TutorRow {
    id: String,
    user_id: String,
    full_name: String,
}

#[derive(sqlx::FromRow)]
struct LessonRow {
    id: String,
    tutor_id: String,
    subject_name: String,
    grade: String,
    level: String,
    description: String,
    appointed_at: i64,
    format: String,
    location_or_link: Option<String>,
    status: String,
    summary: Option<String>,
}

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    lesson_id: String,
    tutee_user_id: String,
    tutee_full_name: String,
    tutee_email: String,
    presence: Option<bool>,
    clarity: Option<i16>,
    understanding: Option<i16>,
    focus: Option<i16>,
    helpful: Option<i16>,
    enrolled_at: i64,
}

fn parse_id(raw: &str) -> Result<Ulid, StoreError> {
    Ulid::from_string(raw).map_err(|e| StoreError::Corrupt(format!("bad id {raw:?}: {e}")))
}

fn parse_rating(raw: Option<i16>) -> Result<Option<u8>, StoreError> {
    raw.map(|r| u8::try_from(r).map_err(|_| StoreError::Corrupt(format!("rating {r} out of range"))))
        .transpose()
}

impl TryFrom<TutorRow> for Tutor {
    type Error = StoreError;

    fn try_from(row: TutorRow) -> Result<Self, Self::Error> {
        Ok(Tutor {
            id: parse_id(&row.id)?,
            user_id: row.user_id,
            full_name: row.full_name,
        })
    }
}

impl TryFrom<LessonRow> for Lesson {
    type Error = StoreError;

    fn try_from(row: LessonRow) -> Result<Self, Self::Error> {
        Ok(Lesson {
            id: parse_id(&row.id)?,
            tutor_id: parse_id(&row.tutor_id)?,
            subject_name: row.subject_name,
            grade: row.grade,
            level: row.level,
            description: row.description,
            appointed_at: row.appointed_at,
            format: row.format.parse().map_err(StoreError::Corrupt)?,
            location_or_link: row.location_or_link,
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            summary: row.summary,
        })
    }
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = StoreError;

    fn try_from(row: EnrollmentRow) -> Result<Self, Self::Error> {
        Ok(Enrollment {
            lesson_id: parse_id(&row.lesson_id)?,
            tutee_user_id: row.tutee_user_id,
            tutee_full_name: row.tutee_full_name,
            tutee_email: row.tutee_email,
            presence: row.presence,
            clarity: parse_rating(row.clarity)?,
            understanding: parse_rating(row.understanding)?,
            focus: parse_rating(row.focus)?,
            helpful: parse_rating(row.helpful)?,
            enrolled_at: row.enrolled_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn insert_err(e: sqlx::Error, key: String) -> StoreError {
    if let sqlx::Error::Database(db) = &e
        && db.is_unique_violation()
    {
        return StoreError::Duplicate(key);
    }
    StoreError::Database(e)
}

/// Filter over `lessons l`; a NULL parameter disables its clause.
const LESSON_FILTER: &str = r#"
    WHERE ($1::text IS NULL OR l.tutor_id = $1)
      AND (cardinality($2::text[]) = 0 OR l.status = ANY($2))
      AND ($3::bigint IS NULL OR l.appointed_at >= $3)
      AND ($4::bigint IS NULL OR l.appointed_at < $4)
      AND ($5::text IS NULL OR l.subject_name = $5)
      AND ($6::text IS NULL OR l.grade = $6)
      AND ($7::text IS NULL OR l.level = $7)
      AND ($8::text IS NULL OR EXISTS (
            SELECT 1 FROM enrollments e WHERE e.lesson_id = l.id AND e.tutee_user_id = $8))
      AND ($9::text IS NULL OR NOT EXISTS (
            SELECT 1 FROM enrollments e WHERE e.lesson_id = l.id AND e.tutee_user_id = $9))
      AND ($10::boolean IS NULL OR EXISTS (
            SELECT 1 FROM enrollments e WHERE e.lesson_id = l.id) = $10)
      AND ($11::bigint IS NULL OR (
            SELECT COUNT(*) FROM enrollments e WHERE e.lesson_id = l.id) < $11)
"#;

fn select_lessons_sql() -> String {
    format!("SELECT {LESSON_COLUMNS} FROM lessons l {LESSON_FILTER} ORDER BY l.appointed_at ASC, l.id ASC")
}

fn count_lessons_sql() -> String {
    format!("SELECT COUNT(*) FROM lessons l {LESSON_FILTER}")
}

fn bind_filter<'q, O>(
    query: QueryAs<'q, Postgres, O, PgArguments>,
    filter: &'q LessonFilter,
) -> QueryAs<'q, Postgres, O, PgArguments> {
    let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
    query
        .bind(filter.tutor_id.map(|id| id.to_string()))
        .bind(statuses)
        .bind(filter.starts_at_or_after)
        .bind(filter.starts_before)
        .bind(filter.subject_name.as_deref())
        .bind(filter.grade.as_deref())
        .bind(filter.level.as_deref())
        .bind(filter.enrolled_tutee.as_deref())
        .bind(filter.not_enrolled_tutee.as_deref())
        .bind(filter.has_enrollments)
        .bind(filter.seats_below.map(i64::from))
}

/// Postgres-backed store. Row locks are `SELECT ... FOR UPDATE`; per-tutee
/// serialization uses a transaction-scoped advisory lock since a tutee has no
/// row of its own.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| StoreError::Unavailable("LESSONBOOK_DATABASE_URL is not set".into()))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .acquire_timeout(config.db_acquire_timeout)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(StoreError::Migration)?;
        info!("schema migrations applied");
        Ok(())
    }
}

#[async_trait]
impl SchedulingStore for PgStore {
    async fn begin(&self) -> Result<Tx, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn find_tutor_by_user(&self, user_id: &str) -> Result<Option<Tutor>, StoreError> {
        sqlx::query_as::<_, TutorRow>("SELECT id, user_id, full_name FROM tutors WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Tutor::try_from)
            .transpose()
    }

    async fn find_tutors(&self, ids: &[Ulid]) -> Result<Vec<Tutor>, StoreError> {
        let ids: Vec<String> = ids.iter().map(Ulid::to_string).collect();
        let rows = sqlx::query_as::<_, TutorRow>("SELECT id, user_id, full_name FROM tutors WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn find_lesson(&self, id: Ulid) -> Result<Option<Lesson>, StoreError> {
        sqlx::query_as::<_, LessonRow>(&format!("SELECT {LESSON_COLUMNS} FROM lessons l WHERE l.id = $1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(Lesson::try_from)
            .transpose()
    }

    async fn find_lessons(&self, filter: &LessonFilter) -> Result<Vec<Lesson>, StoreError> {
        let sql = select_lessons_sql();
        let rows = bind_filter(sqlx::query_as::<_, LessonRow>(&sql), filter)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn count_lessons(&self, filter: &LessonFilter) -> Result<u64, StoreError> {
        let sql = count_lessons_sql();
        let (n,): (i64,) = bind_filter(sqlx::query_as(&sql), filter)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    async fn find_enrollments(&self, lesson_ids: &[Ulid]) -> Result<Vec<Enrollment>, StoreError> {
        let ids: Vec<String> = lesson_ids.iter().map(Ulid::to_string).collect();
        let rows = sqlx::query_as::<_, EnrollmentRow>(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE lesson_id = ANY($1) \
             ORDER BY lesson_id, enrolled_at"
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn lock_tutor(&mut self, user_id: &str, full_name: &str) -> Result<Tutor, StoreError> {
        sqlx::query(
            "INSERT INTO tutors (id, user_id, full_name) VALUES ($1, $2, $3) \
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(Ulid::new().to_string())
        .bind(user_id)
        .bind(full_name)
        .execute(&mut *self.tx)
        .await?;

        let row = sqlx::query_as::<_, TutorRow>(
            "SELECT id, user_id, full_name FROM tutors WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Tutor::try_from(row)
    }

    async fn lock_tutee(&mut self, user_id: &str) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(format!("tutee:{user_id}"))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn lock_lesson(&mut self, id: Ulid) -> Result<Option<Lesson>, StoreError> {
        sqlx::query_as::<_, LessonRow>(&format!(
            "SELECT {LESSON_COLUMNS} FROM lessons l WHERE l.id = $1 FOR UPDATE"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await?
        .map(Lesson::try_from)
        .transpose()
    }

    async fn lock_enrollments(&mut self, lesson_id: Ulid) -> Result<Vec<Enrollment>, StoreError> {
        let rows = sqlx::query_as::<_, EnrollmentRow>(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE lesson_id = $1 \
             ORDER BY enrolled_at FOR UPDATE"
        ))
        .bind(lesson_id.to_string())
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn tutor_by_id(&mut self, id: Ulid) -> Result<Option<Tutor>, StoreError> {
        sqlx::query_as::<_, TutorRow>("SELECT id, user_id, full_name FROM tutors WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await?
            .map(Tutor::try_from)
            .transpose()
    }

    async fn find_lessons(&mut self, filter: &LessonFilter) -> Result<Vec<Lesson>, StoreError> {
        let sql = select_lessons_sql();
        let rows = bind_filter(sqlx::query_as::<_, LessonRow>(&sql), filter)
            .fetch_all(&mut *self.tx)
            .await?;
        convert_all(rows)
    }

    async fn count_lessons(&mut self, filter: &LessonFilter) -> Result<u64, StoreError> {
        let sql = count_lessons_sql();
        let (n,): (i64,) = bind_filter(sqlx::query_as(&sql), filter)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(n as u64)
    }

    async fn insert_lesson(&mut self, lesson: &Lesson) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO lessons (id, tutor_id, subject_name, grade, level, description, \
             appointed_at, format, location_or_link, status, summary) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(lesson.id.to_string())
        .bind(lesson.tutor_id.to_string())
        .bind(&lesson.subject_name)
        .bind(&lesson.grade)
        .bind(&lesson.level)
        .bind(&lesson.description)
        .bind(lesson.appointed_at)
        .bind(lesson.format.as_str())
        .bind(&lesson.location_or_link)
        .bind(lesson.status.as_str())
        .bind(&lesson.summary)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| insert_err(e, format!("lesson {}", lesson.id)))?;
        Ok(())
    }

    async fn update_lesson(&mut self, lesson: &Lesson) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE lessons SET description = $2, format = $3, location_or_link = $4, \
             status = $5, summary = $6 WHERE id = $1",
        )
        .bind(lesson.id.to_string())
        .bind(&lesson.description)
        .bind(lesson.format.as_str())
        .bind(&lesson.location_or_link)
        .bind(lesson.status.as_str())
        .bind(&lesson.summary)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!("update of missing lesson {}", lesson.id)));
        }
        Ok(())
    }

    async fn insert_enrollment(&mut self, enrollment: &Enrollment) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO enrollments ({ENROLLMENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(enrollment.lesson_id.to_string())
        .bind(&enrollment.tutee_user_id)
        .bind(&enrollment.tutee_full_name)
        .bind(&enrollment.tutee_email)
        .bind(enrollment.presence)
        .bind(enrollment.clarity.map(i16::from))
        .bind(enrollment.understanding.map(i16::from))
        .bind(enrollment.focus.map(i16::from))
        .bind(enrollment.helpful.map(i16::from))
        .bind(enrollment.enrolled_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            insert_err(
                e,
                format!("enrollment ({}, {})", enrollment.lesson_id, enrollment.tutee_user_id),
            )
        })?;
        Ok(())
    }

    async fn update_enrollment(&mut self, enrollment: &Enrollment) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE enrollments SET presence = $3, clarity = $4, understanding = $5, \
             focus = $6, helpful = $7 WHERE lesson_id = $1 AND tutee_user_id = $2",
        )
        .bind(enrollment.lesson_id.to_string())
        .bind(&enrollment.tutee_user_id)
        .bind(enrollment.presence)
        .bind(enrollment.clarity.map(i16::from))
        .bind(enrollment.understanding.map(i16::from))
        .bind(enrollment.focus.map(i16::from))
        .bind(enrollment.helpful.map(i16::from))
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Corrupt(format!(
                "update of missing enrollment ({}, {})",
                enrollment.lesson_id, enrollment.tutee_user_id
            )));
        }
        Ok(())
    }

    async fn delete_enrollment(&mut self, lesson_id: Ulid, tutee_user_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM enrollments WHERE lesson_id = $1 AND tutee_user_id = $2")
            .bind(lesson_id.to_string())
            .bind(tutee_user_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_enrollments(&mut self, lesson_id: Ulid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM enrollments WHERE lesson_id = $1")
            .bind(lesson_id.to_string())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

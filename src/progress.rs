use serde::{Deserialize, Serialize};
use sqlx::{Acquire, Sqlite, SqliteConnection, SqlitePool};
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::enrollment;
use crate::error::{Error, Result};
use crate::lesson;
use crate::utils::now_utc;

/// Completed over total lessons as a percentage with two decimals; 0 for an empty course.
pub fn completion_rate(completed: i64, total: i64) -> f64 {
    if total <= 0 || completed <= 0 {
        return 0.0;
    }
    let rate = (completed.min(total) as f64 / total as f64) * 100.0;
    (rate * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct LessonProgress {
    pub lesson_id: i64,
    pub watch_secs: i64,
    pub last_position_secs: i64,
    pub is_completed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct CourseProgress {
    pub enrollment_id: i64,
    pub course_id: i64,
    pub completed_lessons: i64,
    pub total_lessons: i64,
    pub completion_rate: f64,
    pub total_watch_secs: i64,
    pub last_lesson_id: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_accessed_at: Option<OffsetDateTime>,
    #[sqlx(skip)]
    pub lessons: Vec<LessonProgress>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ProgressUpdate {
    /// Seconds watched since the previous report
    #[serde(default)]
    pub watch_secs: i64,
    /// Current playback position
    #[serde(default)]
    pub position_secs: i64,
    /// Completion is sticky: `false` never un-completes a lesson
    #[serde(default)]
    pub completed: bool,
}

/// Recount the aggregate of one enrollment from its lesson records.
async fn recalculate_in_tx(conn: &mut SqliteConnection, enrollment_id: i64) -> Result<f64> {
    let (completed, total, watched): (i64, i64, i64) = sqlx::query_as(
        "SELECT
            (SELECT COUNT(*) FROM lesson_progress lp JOIN lessons l ON l.id = lp.lesson_id
             WHERE lp.enrollment_id = e.id AND lp.is_completed = 1 AND l.course_id = e.course_id),
            (SELECT COUNT(*) FROM lessons WHERE course_id = e.course_id),
            (SELECT COALESCE(SUM(watch_secs), 0) FROM lesson_progress WHERE enrollment_id = e.id)
         FROM enrollments e WHERE e.id = ?",
    )
    .bind(enrollment_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| Error::not_found(format!("Enrollment {enrollment_id}")))?;
    let rate = completion_rate(completed, total);
    sqlx::query(
        "UPDATE student_progress SET completed_lessons = ?, total_lessons = ?,
                completion_rate = ?, total_watch_secs = ?
         WHERE enrollment_id = ?",
    )
    .bind(completed)
    .bind(total)
    .bind(rate)
    .bind(watched)
    .bind(enrollment_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE enrollments SET progress_percent = ?1,
                completed_at = CASE WHEN ?1 >= 100 THEN COALESCE(completed_at, ?2) ELSE NULL END
         WHERE id = ?3",
    )
    .bind(rate)
    .bind(now_utc())
    .bind(enrollment_id)
    .execute(&mut *conn)
    .await?;
    Ok(rate)
}

pub async fn recalculate(database: &SqlitePool, enrollment_id: i64) -> Result<f64> {
    let mut tx = database.begin().await?;
    let rate = recalculate_in_tx(&mut tx, enrollment_id).await?;
    tx.commit().await?;
    Ok(rate)
}

/// Lessons were added to or removed from a course: recount every enrollment in it.
pub fn refresh_course_totals<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    course_id: i64,
) -> impl Future<Output = Result<()>> + Send + 'a {
    async move {
    let mut tx = database.begin().await?;
    let enrollments: Vec<i64> = sqlx::query_scalar("SELECT id FROM enrollments WHERE course_id = ?")
        .bind(course_id)
        .fetch_all(&mut *tx)
        .await?;
    for id in enrollments {
        recalculate_in_tx(&mut tx, id).await?;
    }
    tx.commit().await?;
    Ok(())
    }
}

/// Store a watch report for a lesson and recompute course completion.
pub async fn record_lesson_progress(
    database: &SqlitePool,
    user_id: i64,
    lesson_id: i64,
    update: ProgressUpdate,
) -> Result<CourseProgress> {
    if update.watch_secs < 0 || update.position_secs < 0 {
        return Err(Error::BadRequest(
            "Watch time and position cannot be negative".to_string(),
        ));
    }
    let lesson = lesson::get(database, lesson_id).await?;
    let enrollment = enrollment::get_active(database, user_id, lesson.course_id)
        .await?
        .ok_or_else(|| Error::Forbidden("You are not enrolled in this course".to_string()))?;
    let now = now_utc();
    let mut tx = database.begin().await?;
    sqlx::query(
        "INSERT INTO lesson_progress (user_id, lesson_id, enrollment_id, watch_secs,
                                      last_position_secs, is_completed, completed_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, CASE WHEN ?6 THEN ?7 END, ?7)
         ON CONFLICT (user_id, lesson_id) DO UPDATE SET
            enrollment_id = excluded.enrollment_id,
            watch_secs = watch_secs + excluded.watch_secs,
            last_position_secs = excluded.last_position_secs,
            completed_at = CASE WHEN is_completed = 0 AND excluded.is_completed = 1
                                THEN excluded.updated_at ELSE completed_at END,
            is_completed = MAX(is_completed, excluded.is_completed),
            updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(lesson_id)
    .bind(enrollment.id)
    .bind(update.watch_secs)
    .bind(update.position_secs)
    .bind(update.completed)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "UPDATE student_progress SET last_lesson_id = ?, last_accessed_at = ?
         WHERE enrollment_id = ?",
    )
    .bind(lesson_id)
    .bind(now)
    .bind(enrollment.id)
    .execute(&mut *tx)
    .await?;
    recalculate_in_tx(&mut tx, enrollment.id).await?;
    tx.commit().await?;
    course_progress(database, user_id, lesson.course_id).await
}

pub async fn course_progress(
    database: &SqlitePool,
    user_id: i64,
    course_id: i64,
) -> Result<CourseProgress> {
    let mut progress: CourseProgress = sqlx::query_as(
        "SELECT p.enrollment_id, p.course_id, p.completed_lessons, p.total_lessons,
                p.completion_rate, p.total_watch_secs, p.last_lesson_id, p.last_accessed_at
         FROM student_progress p WHERE p.user_id = ? AND p.course_id = ?",
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_optional(database)
    .await?
    .ok_or_else(|| Error::NotFound("No progress recorded for this course".to_string()))?;
    progress.lessons = sqlx::query_as(
        "SELECT lesson_id, watch_secs, last_position_secs, is_completed, completed_at, updated_at
         FROM lesson_progress WHERE enrollment_id = ? ORDER BY lesson_id",
    )
    .bind(progress.enrollment_id)
    .fetch_all(database)
    .await?;
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lesson::LessonInput;
    use crate::{course, db, user};

    fn done() -> ProgressUpdate {
        ProgressUpdate {
            watch_secs: 600,
            position_secs: 600,
            completed: true,
        }
    }

    #[test]
    fn rate_formula() {
        assert_eq!(completion_rate(0, 0), 0.0);
        assert_eq!(completion_rate(1, 4), 25.0);
        assert_eq!(completion_rate(1, 3), 33.33);
        assert_eq!(completion_rate(3, 3), 100.0);
        assert_eq!(completion_rate(5, 3), 100.0);
    }

    #[tokio::test]
    async fn completing_lessons_updates_rate() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let student = user::tests::student(&database, "s@example.com").await;
        let (course_id, lessons) =
            course::tests::published(&database, professor, "Progress", 0, 4).await;
        let enrollment = enrollment::enroll_free(&database, student, course_id).await.unwrap();

        let partial = record_lesson_progress(
            &database,
            student,
            lessons[0],
            ProgressUpdate {
                watch_secs: 120,
                position_secs: 120,
                completed: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(partial.completion_rate, 0.0);
        assert_eq!(partial.total_watch_secs, 120);

        let one = record_lesson_progress(&database, student, lessons[0], done()).await.unwrap();
        assert_eq!(one.completed_lessons, 1);
        assert_eq!(one.total_lessons, 4);
        assert_eq!(one.completion_rate, 25.0);
        assert_eq!(one.total_watch_secs, 720);
        assert_eq!(one.last_lesson_id, Some(lessons[0]));

        // completion is sticky
        let again = record_lesson_progress(&database, student, lessons[0], ProgressUpdate::default())
            .await
            .unwrap();
        assert_eq!(again.completed_lessons, 1);
        assert!(again.lessons[0].is_completed);

        for id in &lessons[1..] {
            record_lesson_progress(&database, student, *id, done()).await.unwrap();
        }
        let e = enrollment::get(&database, enrollment.id).await.unwrap();
        assert_eq!(e.progress_percent, 100.0);
        assert!(e.completed_at.is_some());
    }

    #[tokio::test]
    async fn new_lesson_lowers_completion() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let student = user::tests::student(&database, "s@example.com").await;
        let (course_id, lessons) =
            course::tests::published(&database, professor, "Growing", 0, 1).await;
        let enrollment = enrollment::enroll_free(&database, student, course_id).await.unwrap();
        record_lesson_progress(&database, student, lessons[0], done()).await.unwrap();
        lesson::create(
            &database,
            course_id,
            LessonInput {
                title: "Bonus".to_string(),
                description: None,
                is_free_preview: false,
            },
        )
        .await
        .unwrap();
        let progress = course_progress(&database, student, course_id).await.unwrap();
        assert_eq!(progress.total_lessons, 2);
        assert_eq!(progress.completion_rate, 50.0);
        assert_eq!(recalculate(&database, enrollment.id).await.unwrap(), 50.0);
        let e = enrollment::get(&database, enrollment.id).await.unwrap();
        assert!(e.completed_at.is_none());
    }

    #[tokio::test]
    async fn requires_enrollment() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let student = user::tests::student(&database, "s@example.com").await;
        let (_, lessons) = course::tests::published(&database, professor, "Closed", 900, 1).await;
        assert!(matches!(
            record_lesson_progress(&database, student, lessons[0], done())
                .await
                .unwrap_err(),
            Error::Forbidden(_)
        ));
        assert!(matches!(
            record_lesson_progress(
                &database,
                student,
                lessons[0],
                ProgressUpdate {
                    watch_secs: -1,
                    ..Default::default()
                }
            )
            .await
            .unwrap_err(),
            Error::BadRequest(_)
        ));
    }
}

use serde::{Deserialize, Serialize};
use sqlx::{Acquire, Sqlite, SqliteConnection, SqliteExecutor, SqlitePool};
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::error::{Error, Result};
use crate::utils::now_utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Active,
    Expired,
    Refunded,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Enrollment {
    pub id: i64,
    pub user_id: i64,
    pub course_id: i64,
    pub status: EnrollmentStatus,
    pub coupon_id: Option<i64>,
    pub order_id: Option<i64>,
    pub price_paid: i64,
    pub progress_percent: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub enrolled_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// An enrollment as listed on the student's dashboard.
#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct EnrolledCourse {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub enrollment: Enrollment,
    pub course_title: String,
    pub course_slug: String,
    pub completed_lessons: i64,
    pub total_lessons: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_accessed_at: Option<OffsetDateTime>,
}

/// A student as seen by the professor of a course.
#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct EnrolledStudent {
    pub enrollment_id: i64,
    pub user_id: i64,
    pub name: String,
    pub email: String,
    pub status: EnrollmentStatus,
    pub progress_percent: f64,
    pub completed_lessons: i64,
    pub total_lessons: i64,
    pub total_watch_secs: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub enrolled_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_accessed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct NewEnrollment {
    pub user_id: i64,
    pub course_id: i64,
    pub coupon_id: Option<i64>,
    pub order_id: Option<i64>,
    pub price_paid: i64,
    pub expires_at: Option<OffsetDateTime>,
}

const ENROLLMENT_COLUMNS: &str = "e.id, e.user_id, e.course_id, e.status, e.coupon_id, e.order_id,
    e.price_paid, e.progress_percent, e.enrolled_at, e.expires_at, e.completed_at";

/// Create the enrollment and its progress aggregate on the caller's transaction.
/// A refunded or expired enrollment for the same pair is reactivated in place.
pub async fn create_in_tx(conn: &mut SqliteConnection, new: &NewEnrollment) -> Result<i64> {
    let existing: Option<(i64, EnrollmentStatus)> =
        sqlx::query_as("SELECT id, status FROM enrollments WHERE user_id = ? AND course_id = ?")
            .bind(new.user_id)
            .bind(new.course_id)
            .fetch_optional(&mut *conn)
            .await?;
    let now = now_utc();
    let id = match existing {
        Some((_, EnrollmentStatus::Active)) => {
            return Err(Error::Conflict(
                "Already enrolled in this course".to_string(),
            ));
        }
        Some((id, _)) => {
            sqlx::query(
                "UPDATE enrollments SET status = 'active', coupon_id = ?, order_id = ?,
                        price_paid = ?, enrolled_at = ?, expires_at = ?
                 WHERE id = ?",
            )
            .bind(new.coupon_id)
            .bind(new.order_id)
            .bind(new.price_paid)
            .bind(now)
            .bind(new.expires_at)
            .bind(id)
            .execute(&mut *conn)
            .await?;
            id
        }
        None => sqlx::query(
            "INSERT INTO enrollments (user_id, course_id, coupon_id, order_id, price_paid,
                                      enrolled_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.user_id)
        .bind(new.course_id)
        .bind(new.coupon_id)
        .bind(new.order_id)
        .bind(new.price_paid)
        .bind(now)
        .bind(new.expires_at)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid(),
    };
    sqlx::query(
        "INSERT OR IGNORE INTO student_progress (enrollment_id, user_id, course_id, total_lessons)
         VALUES (?1, ?2, ?3, (SELECT COUNT(*) FROM lessons WHERE course_id = ?3))",
    )
    .bind(id)
    .bind(new.user_id)
    .bind(new.course_id)
    .execute(&mut *conn)
    .await?;
    info!(
        "user {} enrolled in course {} (enrollment {})",
        new.user_id, new.course_id, id
    );
    Ok(id)
}

pub async fn get(executor: impl SqliteExecutor<'_>, id: i64) -> Result<Enrollment> {
    sqlx::query_as(&format!(
        "SELECT {ENROLLMENT_COLUMNS} FROM enrollments e WHERE e.id = ?"
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| Error::not_found(format!("Enrollment {id}")))
}

/// Enroll in a published free course.
pub async fn enroll_free(database: &SqlitePool, user_id: i64, course_id: i64) -> Result<Enrollment> {
    let course: Option<(bool, bool)> =
        sqlx::query_as("SELECT is_published, is_free FROM courses WHERE id = ?")
            .bind(course_id)
            .fetch_optional(database)
            .await?;
    match course {
        Some((true, true)) => {}
        Some((true, false)) => {
            return Err(Error::BadRequest(
                "This course is not free; check out instead".to_string(),
            ));
        }
        _ => return Err(Error::not_found(format!("Course {course_id}"))),
    }
    let mut tx = database.begin().await?;
    let id = create_in_tx(
        &mut tx,
        &NewEnrollment {
            user_id,
            course_id,
            ..Default::default()
        },
    )
    .await?;
    tx.commit().await?;
    get(database, id).await
}

/// Admin-granted access without payment.
pub fn grant<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    user_id: i64,
    course_id: i64,
    expires_at: Option<OffsetDateTime>,
) -> impl Future<Output = Result<Enrollment>> + Send + 'a {
    async move {
    let mut tx = database.begin().await?;
    let id = create_in_tx(
        &mut tx,
        &NewEnrollment {
            user_id,
            course_id,
            expires_at,
            ..Default::default()
        },
    )
    .await?;
    let granted = get(&mut *tx, id).await?;
    tx.commit().await?;
    Ok(granted)
    }
}

/// The user's enrollment in the course if it currently grants access. Enrollments past
/// their expiry are marked expired on the way.
pub async fn get_active(
    database: &SqlitePool,
    user_id: i64,
    course_id: i64,
) -> Result<Option<Enrollment>> {
    let enrollment: Option<Enrollment> = sqlx::query_as(&format!(
        "SELECT {ENROLLMENT_COLUMNS} FROM enrollments e WHERE e.user_id = ? AND e.course_id = ?"
    ))
    .bind(user_id)
    .bind(course_id)
    .fetch_optional(database)
    .await?;
    let Some(enrollment) = enrollment else {
        return Ok(None);
    };
    if enrollment.status != EnrollmentStatus::Active {
        return Ok(None);
    }
    if enrollment.expires_at.is_some_and(|at| at <= now_utc()) {
        sqlx::query("UPDATE enrollments SET status = 'expired' WHERE id = ?")
            .bind(enrollment.id)
            .execute(database)
            .await?;
        return Ok(None);
    }
    Ok(Some(enrollment))
}

/// Mark every overdue enrollment as expired, returning how many changed.
pub async fn expire_due(database: &SqlitePool) -> Result<u64> {
    let now = now_utc();
    let due: Vec<(i64, Option<OffsetDateTime>)> = sqlx::query_as(
        "SELECT id, expires_at FROM enrollments WHERE status = 'active' AND expires_at IS NOT NULL",
    )
    .fetch_all(database)
    .await?;
    let mut changed = 0;
    for (id, _) in due.into_iter().filter(|(_, at)| at.is_some_and(|at| at <= now)) {
        sqlx::query("UPDATE enrollments SET status = 'expired' WHERE id = ?")
            .bind(id)
            .execute(database)
            .await?;
        changed += 1;
    }
    if changed > 0 {
        info!("expired {} enrollment(s)", changed);
    }
    Ok(changed)
}

pub async fn list_for_user(database: &SqlitePool, user_id: i64) -> Result<Vec<EnrolledCourse>> {
    let courses = sqlx::query_as(&format!(
        "SELECT {ENROLLMENT_COLUMNS}, c.title AS course_title, c.slug AS course_slug,
                COALESCE(p.completed_lessons, 0) AS completed_lessons,
                COALESCE(p.total_lessons, 0) AS total_lessons, p.last_accessed_at
         FROM enrollments e
         JOIN courses c ON c.id = e.course_id
         LEFT JOIN student_progress p ON p.enrollment_id = e.id
         WHERE e.user_id = ?
         ORDER BY e.enrolled_at DESC"
    ))
    .bind(user_id)
    .fetch_all(database)
    .await?;
    Ok(courses)
}

pub async fn students_of_course(database: &SqlitePool, course_id: i64) -> Result<Vec<EnrolledStudent>> {
    let students = sqlx::query_as(
        "SELECT e.id AS enrollment_id, u.id AS user_id, u.name, u.email, e.status,
                e.progress_percent, COALESCE(p.completed_lessons, 0) AS completed_lessons,
                COALESCE(p.total_lessons, 0) AS total_lessons,
                COALESCE(p.total_watch_secs, 0) AS total_watch_secs, e.enrolled_at,
                p.last_accessed_at
         FROM enrollments e
         JOIN users u ON u.id = e.user_id
         LEFT JOIN student_progress p ON p.enrollment_id = e.id
         WHERE e.course_id = ?
         ORDER BY e.enrolled_at",
    )
    .bind(course_id)
    .fetch_all(database)
    .await?;
    Ok(students)
}

/// Revoke access and mark the originating order and payment refunded.
pub fn refund<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    id: i64,
) -> impl Future<Output = Result<Enrollment>> + Send + 'a {
    async move {
    let mut tx = database.begin().await?;
    let enrollment = get(&mut *tx, id).await?;
    let already = || Error::Conflict("Enrollment already refunded".to_string());
    if enrollment.status == EnrollmentStatus::Refunded {
        return Err(already());
    }
    let now = now_utc();
    let result = sqlx::query(
        "UPDATE enrollments SET status = 'refunded' WHERE id = ? AND status != 'refunded'",
    )
    .bind(id)
    .execute(&mut *tx)
    .await?;
    if result.rows_affected() == 0 {
        return Err(already());
    }
    if let Some(order_id) = enrollment.order_id {
        sqlx::query("UPDATE orders SET status = 'refunded', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(order_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE payments SET status = 'refunded', updated_at = ?
             WHERE order_id = ? AND status = 'succeeded'",
        )
        .bind(now)
        .bind(order_id)
        .execute(&mut *tx)
        .await?;
    }
    let refunded = get(&mut *tx, id).await?;
    tx.commit().await?;
    info!("refunded enrollment {}", id);
    Ok(refunded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{course, db, user};
    use time::Duration;

    #[tokio::test]
    async fn cannot_enroll_twice() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let student = user::tests::student(&database, "s@example.com").await;
        let (course_id, _) = course::tests::published(&database, professor, "Free", 0, 3).await;

        let enrollment = enroll_free(&database, student, course_id).await.unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Active);
        assert!(matches!(
            enroll_free(&database, student, course_id).await.unwrap_err(),
            Error::Conflict(_)
        ));

        let listed = list_for_user(&database, student).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].total_lessons, 3);
        assert_eq!(listed[0].course_slug, "free");
    }

    #[tokio::test]
    async fn paid_and_unpublished_courses_are_not_free() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let student = user::tests::student(&database, "s@example.com").await;
        let (paid, _) = course::tests::published(&database, professor, "Paid", 1000, 1).await;
        let draft = course::create(&database, course::tests::input("Draft", professor))
            .await
            .unwrap();
        assert!(matches!(
            enroll_free(&database, student, paid).await.unwrap_err(),
            Error::BadRequest(_)
        ));
        assert!(matches!(
            enroll_free(&database, student, draft).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn expired_grant_loses_access() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let student = user::tests::student(&database, "s@example.com").await;
        let (course_id, _) = course::tests::published(&database, professor, "Timed", 1000, 1).await;
        let enrollment = grant(
            &database,
            student,
            course_id,
            Some(now_utc() - Duration::minutes(1)),
        )
        .await
        .unwrap();
        assert!(get_active(&database, student, course_id).await.unwrap().is_none());
        assert_eq!(
            get(&database, enrollment.id).await.unwrap().status,
            EnrollmentStatus::Expired
        );
        // an expired enrollment can be granted again
        grant(&database, student, course_id, None).await.unwrap();
        assert!(get_active(&database, student, course_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expire_due_sweeps_overdue() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let a = user::tests::student(&database, "a@example.com").await;
        let b = user::tests::student(&database, "b@example.com").await;
        let (course_id, _) = course::tests::published(&database, professor, "Sweep", 1000, 1).await;
        grant(&database, a, course_id, Some(now_utc() - Duration::hours(1))).await.unwrap();
        grant(&database, b, course_id, Some(now_utc() + Duration::days(30))).await.unwrap();
        assert_eq!(expire_due(&database).await.unwrap(), 1);
        assert_eq!(expire_due(&database).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refund_revokes_access() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let student = user::tests::student(&database, "s@example.com").await;
        let (course_id, _) = course::tests::published(&database, professor, "Refund", 0, 1).await;
        let enrollment = enroll_free(&database, student, course_id).await.unwrap();
        let refunded = refund(&database, enrollment.id).await.unwrap();
        assert_eq!(refunded.status, EnrollmentStatus::Refunded);
        assert!(get_active(&database, student, course_id).await.unwrap().is_none());
        assert!(matches!(
            refund(&database, enrollment.id).await.unwrap_err(),
            Error::Conflict(_)
        ));
        let students = students_of_course(&database, course_id).await.unwrap();
        assert_eq!(students.len(), 1);
        assert_eq!(students[0].status, EnrollmentStatus::Refunded);
    }
}

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sqlx::{Acquire, Sqlite, SqliteExecutor, SqlitePool};
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::enrollment;
use crate::error::{Error, Result};
use crate::progress;
use crate::user::SessionUser;
use crate::utils::now_utc;

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Lesson {
    pub id: i64,
    pub course_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub position: i64,
    #[serde(skip_serializing)]
    pub video_key: Option<String>,
    pub video_duration_secs: i64,
    #[serde(skip_serializing)]
    pub document_key: Option<String>,
    pub is_free_preview: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Public table-of-contents entry; never exposes media.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LessonOutline {
    pub id: i64,
    pub title: String,
    pub position: i64,
    pub video_duration_secs: i64,
    pub is_free_preview: bool,
    pub has_video: bool,
    pub has_document: bool,
}

impl From<&Lesson> for LessonOutline {
    fn from(l: &Lesson) -> Self {
        Self {
            id: l.id,
            title: l.title.clone(),
            position: l.position,
            video_duration_secs: l.video_duration_secs,
            is_free_preview: l.is_free_preview,
            has_video: l.video_key.is_some(),
            has_document: l.document_key.is_some(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct LessonInput {
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub is_free_preview: bool,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct LessonUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub is_free_preview: Option<bool>,
}

/// Who is asking to watch a lesson.
#[derive(Debug, Clone, Copy)]
pub enum Viewer {
    Anonymous,
    User(SessionUser),
    Admin,
}

const LESSON_COLUMNS: &str = "id, course_id, title, description, position, video_key,
    video_duration_secs, document_key, is_free_preview, created_at, updated_at";

pub async fn get(executor: impl SqliteExecutor<'_>, id: i64) -> Result<Lesson> {
    sqlx::query_as(&format!("SELECT {LESSON_COLUMNS} FROM lessons WHERE id = ?"))
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| Error::not_found(format!("Lesson {id}")))
}

pub async fn list_for_course(
    executor: impl SqliteExecutor<'_>,
    course_id: i64,
) -> Result<Vec<Lesson>> {
    let lessons = sqlx::query_as(&format!(
        "SELECT {LESSON_COLUMNS} FROM lessons WHERE course_id = ? ORDER BY position, id"
    ))
    .bind(course_id)
    .fetch_all(executor)
    .await?;
    Ok(lessons)
}

pub async fn create(database: &SqlitePool, course_id: i64, input: LessonInput) -> Result<i64> {
    let title = input.title.trim();
    if title.is_empty() {
        return Err(Error::BadRequest("Lesson title is required".to_string()));
    }
    let now = now_utc();
    let id = sqlx::query(
        "INSERT INTO lessons (course_id, title, description, position, is_free_preview,
                              created_at, updated_at)
         VALUES (?1, ?2, ?3,
                 (SELECT COALESCE(MAX(position), 0) + 1 FROM lessons WHERE course_id = ?1),
                 ?4, ?5, ?5)",
    )
    .bind(course_id)
    .bind(title)
    .bind(input.description)
    .bind(input.is_free_preview)
    .bind(now)
    .execute(database)
    .await?
    .last_insert_rowid();
    progress::refresh_course_totals(database, course_id).await?;
    Ok(id)
}

pub async fn update(database: &SqlitePool, id: i64, changes: LessonUpdate) -> Result<Lesson> {
    if let Some(title) = &changes.title {
        if title.trim().is_empty() {
            return Err(Error::BadRequest("Lesson title is required".to_string()));
        }
    }
    let result = sqlx::query(
        "UPDATE lessons SET title = COALESCE(?, title), description = COALESCE(?, description),
                is_free_preview = COALESCE(?, is_free_preview), updated_at = ?
         WHERE id = ?",
    )
    .bind(changes.title.map(|t| t.trim().to_string()))
    .bind(changes.description)
    .bind(changes.is_free_preview)
    .bind(now_utc())
    .bind(id)
    .execute(database)
    .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("Lesson {id}")));
    }
    get(database, id).await
}

/// Remove a lesson. Returns its media keys for cleanup.
pub fn delete<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    id: i64,
) -> impl Future<Output = Result<Vec<String>>> + Send + 'a {
    async move {
    let mut conn = database.acquire().await?;
    let lesson = get(&mut *conn, id).await?;
    sqlx::query("DELETE FROM lessons WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    progress::refresh_course_totals(&mut *conn, lesson.course_id).await?;
    Ok(lesson.video_key.into_iter().chain(lesson.document_key).collect())
    }
}

/// `ordered` must name every lesson of the course exactly once.
pub async fn reorder(database: &SqlitePool, course_id: i64, ordered: &[i64]) -> Result<()> {
    let existing: BTreeSet<i64> = list_for_course(database, course_id)
        .await?
        .into_iter()
        .map(|l| l.id)
        .collect();
    let requested: BTreeSet<i64> = ordered.iter().copied().collect();
    if requested.len() != ordered.len() || requested != existing {
        return Err(Error::BadRequest(
            "Lesson order must list every lesson of the course once".to_string(),
        ));
    }
    let mut tx = database.begin().await?;
    let now = now_utc();
    for (i, id) in ordered.iter().enumerate() {
        sqlx::query("UPDATE lessons SET position = ?, updated_at = ? WHERE id = ?")
            .bind(i as i64 + 1)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Attach a video, returning the replaced key.
pub async fn set_video(
    database: &SqlitePool,
    id: i64,
    key: &str,
    duration_secs: i64,
) -> Result<Option<String>> {
    if duration_secs < 0 {
        return Err(Error::BadRequest("Duration cannot be negative".to_string()));
    }
    let previous = get(database, id).await?.video_key;
    sqlx::query(
        "UPDATE lessons SET video_key = ?, video_duration_secs = ?, updated_at = ? WHERE id = ?",
    )
    .bind(key)
    .bind(duration_secs)
    .bind(now_utc())
    .bind(id)
    .execute(database)
    .await?;
    Ok(previous)
}

pub async fn set_document(database: &SqlitePool, id: i64, key: &str) -> Result<Option<String>> {
    let previous = get(database, id).await?.document_key;
    sqlx::query("UPDATE lessons SET document_key = ?, updated_at = ? WHERE id = ?")
        .bind(key)
        .bind(now_utc())
        .bind(id)
        .execute(database)
        .await?;
    Ok(previous)
}

/// Load a lesson if `viewer` may watch it: free previews of published courses are open,
/// everything else needs an active enrollment, ownership of the course or an admin.
pub async fn get_for_viewer(database: &SqlitePool, id: i64, viewer: Viewer) -> Result<Lesson> {
    let lesson = get(database, id).await?;
    let (creator_id, is_published): (i64, bool) =
        sqlx::query_as("SELECT creator_id, is_published FROM courses WHERE id = ?")
            .bind(lesson.course_id)
            .fetch_one(database)
            .await?;
    match viewer {
        Viewer::Admin => Ok(lesson),
        Viewer::User(user) if user.id == creator_id => Ok(lesson),
        _ if !is_published => Err(Error::not_found(format!("Lesson {id}"))),
        _ if lesson.is_free_preview => Ok(lesson),
        Viewer::Anonymous => Err(Error::Unauthorized(
            "Sign in and enroll to watch this lesson".to_string(),
        )),
        Viewer::User(user) => {
            enrollment::get_active(database, user.id, lesson.course_id)
                .await?
                .ok_or_else(|| Error::Forbidden("You are not enrolled in this course".to_string()))?;
            Ok(lesson)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::Role;
    use crate::{course, db, user};

    fn input(title: &str) -> LessonInput {
        LessonInput {
            title: title.to_string(),
            description: None,
            is_free_preview: false,
        }
    }

    #[tokio::test]
    async fn positions_append_and_reorder() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let course_id = course::create(&database, course::tests::input("Graphs", professor))
            .await
            .unwrap();
        let a = create(&database, course_id, input("A")).await.unwrap();
        let b = create(&database, course_id, input("B")).await.unwrap();
        let c = create(&database, course_id, input("C")).await.unwrap();
        let positions: Vec<i64> = list_for_course(&database, course_id)
            .await
            .unwrap()
            .iter()
            .map(|l| l.position)
            .collect();
        assert_eq!(positions, vec![1, 2, 3]);

        reorder(&database, course_id, &[c, a, b]).await.unwrap();
        let ids: Vec<i64> = list_for_course(&database, course_id)
            .await
            .unwrap()
            .iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(ids, vec![c, a, b]);

        assert!(matches!(
            reorder(&database, course_id, &[c, a]).await.unwrap_err(),
            Error::BadRequest(_)
        ));
        assert!(matches!(
            reorder(&database, course_id, &[c, a, a]).await.unwrap_err(),
            Error::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn viewer_access_rules() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let student = user::tests::student(&database, "s@example.com").await;
        let (course_id, lessons) =
            course::tests::published(&database, professor, "Access", 0, 2).await;
        let stranger = SessionUser {
            id: student,
            role: Role::Student,
            is_verified: false,
        };

        // first lesson is a free preview
        get_for_viewer(&database, lessons[0], Viewer::Anonymous).await.unwrap();
        assert!(matches!(
            get_for_viewer(&database, lessons[1], Viewer::Anonymous).await.unwrap_err(),
            Error::Unauthorized(_)
        ));
        assert!(matches!(
            get_for_viewer(&database, lessons[1], Viewer::User(stranger)).await.unwrap_err(),
            Error::Forbidden(_)
        ));
        enrollment::enroll_free(&database, student, course_id).await.unwrap();
        get_for_viewer(&database, lessons[1], Viewer::User(stranger)).await.unwrap();
        get_for_viewer(&database, lessons[1], Viewer::Admin).await.unwrap();
    }

    #[tokio::test]
    async fn unpublished_lessons_hidden_from_public() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let course_id = course::create(&database, course::tests::input("Hidden", professor))
            .await
            .unwrap();
        let id = create(
            &database,
            course_id,
            LessonInput {
                is_free_preview: true,
                ..input("Preview")
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            get_for_viewer(&database, id, Viewer::Anonymous).await.unwrap_err(),
            Error::NotFound(_)
        ));
        let owner = SessionUser {
            id: professor,
            role: Role::Professor,
            is_verified: true,
        };
        get_for_viewer(&database, id, Viewer::User(owner)).await.unwrap();
    }

    #[tokio::test]
    async fn media_keys_are_replaced() {
        let database = db::memory().await.unwrap();
        let professor = user::tests::professor(&database, "prof@example.com").await;
        let course_id = course::create(&database, course::tests::input("Media", professor))
            .await
            .unwrap();
        let id = create(&database, course_id, input("Clip")).await.unwrap();
        assert_eq!(set_video(&database, id, "videos/a.mp4", 30).await.unwrap(), None);
        assert_eq!(
            set_video(&database, id, "videos/b.mp4", 45).await.unwrap(),
            Some("videos/a.mp4".to_string())
        );
        set_document(&database, id, "documents/notes.pdf").await.unwrap();
        let keys = delete(&database, id).await.unwrap();
        assert_eq!(keys, vec!["videos/b.mp4".to_string(), "documents/notes.pdf".to_string()]);
    }
}

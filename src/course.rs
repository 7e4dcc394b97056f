use serde::{Deserialize, Serialize};
use sqlx::{Acquire, Sqlite, SqliteExecutor, SqlitePool};
use time::OffsetDateTime;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::db;
use crate::error::{Error, Result};
use crate::lesson::{self, Lesson, LessonOutline};
use crate::user::{self, Role};
use crate::utils::now_utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CourseLevel {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Course {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub description: Option<String>,
    pub level: CourseLevel,
    #[serde(skip_serializing)]
    pub thumbnail_key: Option<String>,
    /// Signed thumbnail link, filled in by the API layer
    #[sqlx(skip)]
    pub thumbnail_url: Option<String>,
    /// Price in cents
    pub price: i64,
    pub is_free: bool,
    pub is_published: bool,
    pub is_featured: bool,
    pub creator_id: i64,
    pub creator_name: String,
    pub category_id: Option<i64>,
    pub category_name: Option<String>,
    pub lesson_count: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A published course with its lesson outline, as shown on the course page.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CourseDetail {
    #[serde(flatten)]
    pub course: Course,
    pub lessons: Vec<LessonOutline>,
    /// Total video length in seconds
    pub total_duration_secs: i64,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CourseInput {
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub level: CourseLevel,
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub is_free: bool,
    pub category_id: Option<i64>,
    /// Professor who owns the course
    pub creator_id: i64,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct CourseUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub level: Option<CourseLevel>,
    pub price: Option<i64>,
    pub is_free: Option<bool>,
    pub category_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CourseFilter {
    /// Category slug
    pub category: Option<String>,
    pub featured: Option<bool>,
    pub free: Option<bool>,
    /// Matched against the title
    pub q: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessIssue {
    MissingTitle,
    MissingDescription,
    MissingThumbnail,
    MissingCategory,
    NoLessons,
    LessonWithoutVideo,
    MissingPrice,
}

impl std::fmt::Display for ReadinessIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReadinessIssue::MissingTitle => "course has no title",
            ReadinessIssue::MissingDescription => "course has no description",
            ReadinessIssue::MissingThumbnail => "course has no thumbnail",
            ReadinessIssue::MissingCategory => "course has no category",
            ReadinessIssue::NoLessons => "course has no lessons",
            ReadinessIssue::LessonWithoutVideo => "every lesson needs a video",
            ReadinessIssue::MissingPrice => "paid course needs a price",
        };
        f.write_str(s)
    }
}

/// Checklist a course must pass before it can be published. Empty means ready.
pub fn publish_readiness(course: &Course, lessons: &[Lesson]) -> Vec<ReadinessIssue> {
    let present = |s: &Option<String>| s.as_deref().is_some_and(|s| !s.trim().is_empty());
    let mut issues = Vec::new();
    if course.title.trim().is_empty() {
        issues.push(ReadinessIssue::MissingTitle);
    }
    if !present(&course.description) {
        issues.push(ReadinessIssue::MissingDescription);
    }
    if !present(&course.thumbnail_key) {
        issues.push(ReadinessIssue::MissingThumbnail);
    }
    if course.category_id.is_none() {
        issues.push(ReadinessIssue::MissingCategory);
    }
    if lessons.is_empty() {
        issues.push(ReadinessIssue::NoLessons);
    } else if lessons.iter().any(|l| !present(&l.video_key)) {
        issues.push(ReadinessIssue::LessonWithoutVideo);
    }
    if !course.is_free && course.price <= 0 {
        issues.push(ReadinessIssue::MissingPrice);
    }
    issues
}

const COURSE_SELECT: &str = "SELECT c.id, c.title, c.slug, c.description, c.level, c.thumbnail_key,
        c.price, c.is_free, c.is_published, c.is_featured, c.creator_id, u.name AS creator_name,
        c.category_id, cat.name AS category_name,
        (SELECT COUNT(*) FROM lessons WHERE course_id = c.id) AS lesson_count,
        c.published_at, c.created_at, c.updated_at
    FROM courses c
    JOIN users u ON u.id = c.creator_id
    LEFT JOIN categories cat ON cat.id = c.category_id";

fn check_price(price: i64) -> Result<()> {
    if price < 0 {
        return Err(Error::BadRequest("Price cannot be negative".to_string()));
    }
    Ok(())
}

fn readiness_error(issues: &[ReadinessIssue], doing: &str) -> Error {
    let reasons: Vec<String> = issues.iter().map(|i| i.to_string()).collect();
    Error::BadRequest(format!("Course is not ready to {doing}: {}", reasons.join(", ")))
}

pub fn create<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    input: CourseInput,
) -> impl Future<Output = Result<i64>> + Send + 'a {
    async move {
    let title = input.title.trim().to_string();
    if title.is_empty() {
        return Err(Error::BadRequest("Course title is required".to_string()));
    }
    check_price(input.price)?;
    let mut conn = database.acquire().await?;
    let creator = user::get_user(&mut *conn, input.creator_id).await?;
    if creator.role != Role::Professor {
        return Err(Error::BadRequest(format!(
            "User {} is not a professor",
            input.creator_id
        )));
    }
    let slug = db::unique_slug(&mut *conn, "courses", "course", &title).await?;
    let price = if input.is_free { 0 } else { input.price };
    let now = now_utc();
    let id = sqlx::query(
        "INSERT INTO courses (title, slug, description, level, price, is_free, creator_id,
                              category_id, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&title)
    .bind(&slug)
    .bind(input.description)
    .bind(input.level)
    .bind(price)
    .bind(input.is_free)
    .bind(input.creator_id)
    .bind(input.category_id)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    info!("created course {} ({})", id, slug);
    Ok(id)
    }
}

pub async fn get(executor: impl SqliteExecutor<'_>, id: i64) -> Result<Course> {
    sqlx::query_as(&format!("{COURSE_SELECT} WHERE c.id = ?"))
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| Error::not_found(format!("Course {id}")))
}

/// Load a course the given professor may edit.
pub async fn get_owned(database: &SqlitePool, id: i64, professor_id: i64) -> Result<Course> {
    let course = get(database, id).await?;
    if course.creator_id != professor_id {
        return Err(Error::Forbidden("You do not own this course".to_string()));
    }
    Ok(course)
}

/// Apply changes to a course. A published course must still pass the publishing
/// checklist afterwards, otherwise nothing is written.
pub fn update<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    id: i64,
    changes: CourseUpdate,
) -> impl Future<Output = Result<Course>> + Send + 'a {
    async move {
    let mut conn = database.acquire().await?;
    let mut course = get(&mut *conn, id).await?;
    if let Some(title) = changes.title {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::BadRequest("Course title is required".to_string()));
        }
        course.title = title.to_string();
    }
    if changes.description.is_some() {
        course.description = changes.description;
    }
    if let Some(level) = changes.level {
        course.level = level;
    }
    if changes.category_id.is_some() {
        course.category_id = changes.category_id;
    }
    course.is_free = changes.is_free.unwrap_or(course.is_free);
    course.price = if course.is_free {
        0
    } else {
        changes.price.unwrap_or(course.price)
    };
    check_price(course.price)?;
    if course.is_published {
        let lessons = lesson::list_for_course(&mut *conn, id).await?;
        let issues = publish_readiness(&course, &lessons);
        if !issues.is_empty() {
            return Err(readiness_error(&issues, "stay published"));
        }
    }
    sqlx::query(
        "UPDATE courses SET title = ?, description = ?, level = ?, price = ?, is_free = ?,
                category_id = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&course.title)
    .bind(&course.description)
    .bind(course.level)
    .bind(course.price)
    .bind(course.is_free)
    .bind(course.category_id)
    .bind(now_utc())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    get(&mut *conn, id).await
    }
}

/// Replace the thumbnail, returning the previous key so its object can be removed.
pub fn set_thumbnail<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    id: i64,
    key: &'a str,
) -> impl Future<Output = Result<Option<String>>> + Send + 'a {
    async move {
    let mut conn = database.acquire().await?;
    let previous = get(&mut *conn, id).await?.thumbnail_key;
    sqlx::query("UPDATE courses SET thumbnail_key = ?, updated_at = ? WHERE id = ?")
        .bind(key)
        .bind(now_utc())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(previous)
    }
}

/// Remove a course and its lessons. Returns media keys that are no longer referenced.
pub fn delete<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    id: i64,
) -> impl Future<Output = Result<Vec<String>>> + Send + 'a {
    async move {
    let mut conn = database.acquire().await?;
    let course = get(&mut *conn, id).await?;
    let (enrollments, orders): (i64, i64) = sqlx::query_as(
        "SELECT (SELECT COUNT(*) FROM enrollments WHERE course_id = ?1),
                (SELECT COUNT(*) FROM order_items WHERE course_id = ?1)",
    )
    .bind(id)
    .fetch_one(&mut *conn)
    .await?;
    if enrollments > 0 || orders > 0 {
        return Err(Error::Conflict(format!(
            "Course {} has enrollments or orders; unpublish it instead",
            course.title
        )));
    }
    let lessons = lesson::list_for_course(&mut *conn, id).await?;
    sqlx::query("DELETE FROM courses WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    let mut keys: Vec<String> = course.thumbnail_key.into_iter().collect();
    for l in lessons {
        keys.extend(l.video_key);
        keys.extend(l.document_key);
    }
    info!("deleted course {} ({} media objects)", id, keys.len());
    Ok(keys)
    }
}

pub fn publish<'a>(database: impl Acquire<'a, Database = Sqlite> + Send + 'a, id: i64) -> impl Future<Output = Result<Course>> + Send + 'a {
    async move {
    let mut conn = database.acquire().await?;
    let course = get(&mut *conn, id).await?;
    let lessons = lesson::list_for_course(&mut *conn, id).await?;
    let issues = publish_readiness(&course, &lessons);
    if !issues.is_empty() {
        return Err(readiness_error(&issues, "publish"));
    }
    let now = now_utc();
    sqlx::query(
        "UPDATE courses SET is_published = 1, published_at = COALESCE(published_at, ?),
                updated_at = ?
         WHERE id = ?",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    info!("published course {}", id);
    get(&mut *conn, id).await
    }
}

pub fn unpublish<'a>(database: impl Acquire<'a, Database = Sqlite> + Send + 'a, id: i64) -> impl Future<Output = Result<Course>> + Send + 'a {
    async move {
    let mut conn = database.acquire().await?;
    let result = sqlx::query(
        "UPDATE courses SET is_published = 0, is_featured = 0, updated_at = ? WHERE id = ?",
    )
    .bind(now_utc())
    .bind(id)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("Course {id}")));
    }
    get(&mut *conn, id).await
    }
}

pub fn set_featured<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    id: i64,
    featured: bool,
) -> impl Future<Output = Result<Course>> + Send + 'a {
    async move {
    let mut conn = database.acquire().await?;
    let course = get(&mut *conn, id).await?;
    if featured && !course.is_published {
        return Err(Error::BadRequest(
            "Only published courses can be featured".to_string(),
        ));
    }
    sqlx::query("UPDATE courses SET is_featured = ?, updated_at = ? WHERE id = ?")
        .bind(featured)
        .bind(now_utc())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    get(&mut *conn, id).await
    }
}

pub async fn list_published(database: &SqlitePool, filter: &CourseFilter) -> Result<Vec<Course>> {
    let courses = sqlx::query_as(&format!(
        "{COURSE_SELECT}
         WHERE c.is_published = 1
           AND (?1 IS NULL OR cat.slug = ?1)
           AND (?2 IS NULL OR c.is_featured = ?2)
           AND (?3 IS NULL OR c.is_free = ?3)
           AND (?4 IS NULL OR c.title LIKE '%' || ?4 || '%')
         ORDER BY c.is_featured DESC, c.published_at DESC"
    ))
    .bind(filter.category.as_deref())
    .bind(filter.featured)
    .bind(filter.free)
    .bind(filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()))
    .fetch_all(database)
    .await?;
    Ok(courses)
}

pub async fn list_all(database: &SqlitePool) -> Result<Vec<Course>> {
    let courses = sqlx::query_as(&format!("{COURSE_SELECT} ORDER BY c.id DESC"))
        .fetch_all(database)
        .await?;
    Ok(courses)
}

pub async fn list_by_creator(database: &SqlitePool, creator_id: i64) -> Result<Vec<Course>> {
    let courses = sqlx::query_as(&format!(
        "{COURSE_SELECT} WHERE c.creator_id = ? ORDER BY c.id DESC"
    ))
    .bind(creator_id)
    .fetch_all(database)
    .await?;
    Ok(courses)
}

pub async fn get_published_by_slug(database: &SqlitePool, slug: &str) -> Result<CourseDetail> {
    let course: Course = sqlx::query_as(&format!(
        "{COURSE_SELECT} WHERE c.slug = ? AND c.is_published = 1"
    ))
    .bind(slug)
    .fetch_optional(database)
    .await?
    .ok_or_else(|| Error::not_found(format!("Course {slug}")))?;
    let lessons: Vec<LessonOutline> = lesson::list_for_course(database, course.id)
        .await?
        .iter()
        .map(LessonOutline::from)
        .collect();
    let total_duration_secs = lessons.iter().map(|l| l.video_duration_secs).sum();
    Ok(CourseDetail {
        course,
        lessons,
        total_duration_secs,
    })
}

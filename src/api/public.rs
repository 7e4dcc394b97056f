use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::get,
};
use tower_sessions::Session;

use crate::category::{self, Category};
use crate::course::{self, Course, CourseDetail, CourseFilter};
use crate::error::Result;
use crate::lesson;

use super::{LessonView, SharedState, viewer};

#[utoipa::path(
    context_path = "/api/public",
    path = "/categories",
    method(get),
    responses(
        (status = 200, description = "All categories with course counts", body = Vec<Category>)
    )
)]
pub async fn list_categories(State(state): State<SharedState>) -> Result<Json<Vec<Category>>> {
    Ok(Json(category::list(&state.database).await?))
}

#[utoipa::path(
    context_path = "/api/public",
    path = "/courses",
    method(get),
    params(CourseFilter),
    responses(
        (status = 200, description = "Published courses", body = Vec<Course>)
    )
)]
pub async fn list_courses(
    State(state): State<SharedState>,
    Query(filter): Query<CourseFilter>,
) -> Result<Json<Vec<Course>>> {
    let courses = course::list_published(&state.database, &filter).await?;
    Ok(Json(
        courses.into_iter().map(|c| state.with_thumbnail(c)).collect(),
    ))
}

#[utoipa::path(
    context_path = "/api/public",
    path = "/courses/{slug}",
    method(get),
    params(("slug" = String, Path, description = "Course slug")),
    responses(
        (status = 200, description = "Course page with lesson outline", body = CourseDetail),
        (status = 404, description = "No published course with this slug")
    )
)]
pub async fn get_course(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
) -> Result<Json<CourseDetail>> {
    let mut detail = match state.catalog.get(&slug).await {
        Some(detail) => detail,
        None => {
            let detail = course::get_published_by_slug(&state.database, &slug).await?;
            state.catalog.insert(slug, detail.clone()).await;
            detail
        }
    };
    // links expire, so they are signed per request rather than cached
    detail.course = state.with_thumbnail(detail.course);
    Ok(Json(detail))
}

#[utoipa::path(
    context_path = "/api/public",
    path = "/lessons/{id}",
    method(get),
    params(("id" = i64, Path, description = "Lesson id")),
    responses(
        (status = 200, description = "Lesson with signed media links", body = LessonView),
        (status = 401, description = "Lesson is not a free preview"),
        (status = 404, description = "Lesson not found")
    )
)]
pub async fn get_lesson(
    State(state): State<SharedState>,
    session: Session,
    Path(id): Path<i64>,
) -> Result<Json<LessonView>> {
    let viewer = viewer(&state.database, &session).await?;
    let lesson = lesson::get_for_viewer(&state.database, id, viewer).await?;
    Ok(Json(state.lesson_view(lesson)))
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/categories", get(list_categories))
        .route("/courses", get(list_courses))
        .route("/courses/{slug}", get(get_course))
        .route("/lessons/{id}", get(get_lesson))
}

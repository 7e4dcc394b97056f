use axum::{
    Json, Router,
    extract::{Multipart, Path, State},
    http::StatusCode,
    routing::{get, patch, post, put},
};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::course::{self, Course, CourseUpdate};
use crate::enrollment::{self, EnrolledStudent};
use crate::error::{Error, Result};
use crate::lesson::{self, Lesson, LessonInput, LessonUpdate};
use crate::storage::AssetKind;

use super::{CourseWorkspace, LessonView, Professor, SharedState, receive_upload};

#[derive(Deserialize, ToSchema)]
pub struct ReorderRequest {
    /// Every lesson of the course, in the new order
    pub lesson_ids: Vec<i64>,
}

/// Load a lesson whose course the professor owns.
async fn owned_lesson(state: &SharedState, professor_id: i64, id: i64) -> Result<Lesson> {
    let lesson = lesson::get(&state.database, id).await?;
    course::get_owned(&state.database, lesson.course_id, professor_id).await?;
    Ok(lesson)
}

#[utoipa::path(
    context_path = "/api/professor",
    path = "/courses",
    method(get),
    responses(
        (status = 200, description = "Courses owned by the professor", body = Vec<Course>),
        (status = 403, description = "Not a verified professor")
    )
)]
pub async fn list_courses(
    State(state): State<SharedState>,
    Professor(professor): Professor,
) -> Result<Json<Vec<Course>>> {
    let courses = course::list_by_creator(&state.database, professor.id).await?;
    Ok(Json(
        courses.into_iter().map(|c| state.with_thumbnail(c)).collect(),
    ))
}

#[utoipa::path(
    context_path = "/api/professor",
    path = "/courses/{id}",
    method(get),
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "Course with lessons and publishing checklist", body = CourseWorkspace),
        (status = 403, description = "Course owned by someone else")
    )
)]
pub async fn get_course(
    State(state): State<SharedState>,
    Professor(professor): Professor,
    Path(id): Path<i64>,
) -> Result<Json<CourseWorkspace>> {
    let course = course::get_owned(&state.database, id, professor.id).await?;
    Ok(Json(state.workspace(course).await?))
}

#[utoipa::path(
    context_path = "/api/professor",
    path = "/courses/{id}",
    method(patch),
    params(("id" = i64, Path, description = "Course id")),
    request_body = CourseUpdate,
    responses(
        (status = 200, description = "Course updated", body = Course),
        (status = 403, description = "Course owned by someone else")
    )
)]
pub async fn update_course(
    State(state): State<SharedState>,
    Professor(professor): Professor,
    Path(id): Path<i64>,
    Json(changes): Json<CourseUpdate>,
) -> Result<Json<Course>> {
    course::get_owned(&state.database, id, professor.id).await?;
    let course = course::update(&state.database, id, changes).await?;
    state.invalidate_catalog();
    Ok(Json(state.with_thumbnail(course)))
}

#[utoipa::path(
    context_path = "/api/professor",
    path = "/courses/{id}/lessons",
    method(post),
    params(("id" = i64, Path, description = "Course id")),
    request_body = LessonInput,
    responses(
        (status = 201, description = "Lesson appended to the course", body = LessonView),
        (status = 403, description = "Course owned by someone else")
    )
)]
pub async fn create_lesson(
    State(state): State<SharedState>,
    Professor(professor): Professor,
    Path(course_id): Path<i64>,
    Json(input): Json<LessonInput>,
) -> Result<(StatusCode, Json<LessonView>)> {
    course::get_owned(&state.database, course_id, professor.id).await?;
    let id = lesson::create(&state.database, course_id, input).await?;
    state.invalidate_catalog();
    let lesson = lesson::get(&state.database, id).await?;
    Ok((StatusCode::CREATED, Json(state.lesson_view(lesson))))
}

#[utoipa::path(
    context_path = "/api/professor",
    path = "/lessons/{id}",
    method(patch),
    params(("id" = i64, Path, description = "Lesson id")),
    request_body = LessonUpdate,
    responses(
        (status = 200, description = "Lesson updated", body = LessonView),
        (status = 403, description = "Course owned by someone else")
    )
)]
pub async fn update_lesson(
    State(state): State<SharedState>,
    Professor(professor): Professor,
    Path(id): Path<i64>,
    Json(changes): Json<LessonUpdate>,
) -> Result<Json<LessonView>> {
    owned_lesson(&state, professor.id, id).await?;
    let lesson = lesson::update(&state.database, id, changes).await?;
    state.invalidate_catalog();
    Ok(Json(state.lesson_view(lesson)))
}

#[utoipa::path(
    context_path = "/api/professor",
    path = "/lessons/{id}",
    method(delete),
    params(("id" = i64, Path, description = "Lesson id")),
    responses(
        (status = 204, description = "Lesson and its media removed"),
        (status = 403, description = "Course owned by someone else")
    )
)]
pub async fn delete_lesson(
    State(state): State<SharedState>,
    Professor(professor): Professor,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    owned_lesson(&state, professor.id, id).await?;
    let keys = lesson::delete(&state.database, id).await?;
    state.invalidate_catalog();
    state.storage.delete_all(&keys).await;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    context_path = "/api/professor",
    path = "/courses/{id}/lessons/order",
    method(put),
    params(("id" = i64, Path, description = "Course id")),
    request_body = ReorderRequest,
    responses(
        (status = 200, description = "Lessons in their new order", body = Vec<LessonView>),
        (status = 400, description = "Ids do not match the course's lessons")
    )
)]
pub async fn reorder_lessons(
    State(state): State<SharedState>,
    Professor(professor): Professor,
    Path(course_id): Path<i64>,
    Json(req): Json<ReorderRequest>,
) -> Result<Json<Vec<LessonView>>> {
    course::get_owned(&state.database, course_id, professor.id).await?;
    lesson::reorder(&state.database, course_id, &req.lesson_ids).await?;
    state.invalidate_catalog();
    let lessons = lesson::list_for_course(&state.database, course_id).await?;
    Ok(Json(
        lessons.into_iter().map(|l| state.lesson_view(l)).collect(),
    ))
}

#[utoipa::path(
    context_path = "/api/professor",
    path = "/lessons/{id}/video",
    method(post),
    params(("id" = i64, Path, description = "Lesson id")),
    request_body(content_type = "multipart/form-data", description = "`file` plus optional `duration_secs`"),
    responses(
        (status = 200, description = "Video attached", body = LessonView),
        (status = 400, description = "Unsupported or oversized file")
    )
)]
pub async fn upload_video(
    State(state): State<SharedState>,
    Professor(professor): Professor,
    Path(id): Path<i64>,
    multipart: Multipart,
) -> Result<Json<LessonView>> {
    owned_lesson(&state, professor.id, id).await?;
    let upload = receive_upload(multipart, &state.storage, AssetKind::Video).await?;
    let duration = match upload.fields.get("duration_secs") {
        Some(value) => value.trim().parse::<i64>().map_err(|_| {
            Error::BadRequest(format!("Invalid duration_secs {value}"))
        }),
        None => Ok(0),
    };
    let replaced = match duration {
        Ok(duration) => lesson::set_video(&state.database, id, &upload.key, duration).await,
        Err(e) => Err(e),
    };
    match replaced {
        Ok(previous) => state.storage.delete_all(&previous.into_iter().collect::<Vec<_>>()).await,
        Err(e) => {
            state.storage.delete_all(&[upload.key]).await;
            return Err(e);
        }
    }
    state.invalidate_catalog();
    let lesson = lesson::get(&state.database, id).await?;
    Ok(Json(state.lesson_view(lesson)))
}

#[utoipa::path(
    context_path = "/api/professor",
    path = "/lessons/{id}/document",
    method(post),
    params(("id" = i64, Path, description = "Lesson id")),
    request_body(content_type = "multipart/form-data", description = "`file`"),
    responses(
        (status = 200, description = "Document attached", body = LessonView),
        (status = 400, description = "Unsupported or oversized file")
    )
)]
pub async fn upload_document(
    State(state): State<SharedState>,
    Professor(professor): Professor,
    Path(id): Path<i64>,
    multipart: Multipart,
) -> Result<Json<LessonView>> {
    owned_lesson(&state, professor.id, id).await?;
    let upload = receive_upload(multipart, &state.storage, AssetKind::Document).await?;
    match lesson::set_document(&state.database, id, &upload.key).await {
        Ok(previous) => state.storage.delete_all(&previous.into_iter().collect::<Vec<_>>()).await,
        Err(e) => {
            state.storage.delete_all(&[upload.key]).await;
            return Err(e);
        }
    }
    state.invalidate_catalog();
    let lesson = lesson::get(&state.database, id).await?;
    Ok(Json(state.lesson_view(lesson)))
}

#[utoipa::path(
    context_path = "/api/professor",
    path = "/courses/{id}/students",
    method(get),
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "Students of the course with progress", body = Vec<EnrolledStudent>),
        (status = 403, description = "Course owned by someone else")
    )
)]
pub async fn list_students(
    State(state): State<SharedState>,
    Professor(professor): Professor,
    Path(course_id): Path<i64>,
) -> Result<Json<Vec<EnrolledStudent>>> {
    course::get_owned(&state.database, course_id, professor.id).await?;
    Ok(Json(
        enrollment::students_of_course(&state.database, course_id).await?,
    ))
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/courses", get(list_courses))
        .route("/courses/{id}", get(get_course).patch(update_course))
        .route("/courses/{id}/lessons", post(create_lesson))
        .route("/courses/{id}/lessons/order", put(reorder_lessons))
        .route("/courses/{id}/students", get(list_students))
        .route("/lessons/{id}", patch(update_lesson).delete(delete_lesson))
        .route("/lessons/{id}/video", post(upload_video))
        .route("/lessons/{id}/document", post(upload_document))
}

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use crate::coupon::{self, AppliedCoupon};
use crate::course;
use crate::enrollment::{self, EnrolledCourse, Enrollment};
use crate::error::{Error, Result};
use crate::lesson::{self, Viewer};
use crate::order::{self, Checkout, Order, OrderDetail};
use crate::progress::{self, CourseProgress, ProgressUpdate};

use super::{CurrentUser, LessonView, PAYMENT_PROVIDER, SharedState};

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CheckoutRequest {
    pub coupon_code: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CouponPreviewQuery {
    pub course_id: i64,
}

#[utoipa::path(
    context_path = "/api/student",
    path = "/enrollments",
    method(get),
    responses(
        (status = 200, description = "The user's courses with progress", body = Vec<EnrolledCourse>),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn list_enrollments(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<EnrolledCourse>>> {
    Ok(Json(enrollment::list_for_user(&state.database, user.id).await?))
}

#[utoipa::path(
    context_path = "/api/student",
    path = "/courses/{id}/enroll",
    method(post),
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 201, description = "Enrolled", body = Enrollment),
        (status = 400, description = "Course is not free"),
        (status = 409, description = "Already enrolled")
    )
)]
pub async fn enroll_free(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<i64>,
) -> Result<(StatusCode, Json<Enrollment>)> {
    let enrollment = enrollment::enroll_free(&state.database, user.id, course_id).await?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

#[utoipa::path(
    context_path = "/api/student",
    path = "/courses/{id}/checkout",
    method(post),
    params(("id" = i64, Path, description = "Course id")),
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Order opened, or settled when nothing is owed", body = Checkout),
        (status = 400, description = "Course is free or coupon rejected"),
        (status = 409, description = "Already enrolled")
    )
)]
pub async fn checkout(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<i64>,
    Json(req): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<Checkout>)> {
    let started = order::checkout(
        &state.database,
        PAYMENT_PROVIDER,
        user.id,
        course_id,
        req.coupon_code.as_deref().filter(|c| !c.trim().is_empty()),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(started)))
}

#[utoipa::path(
    context_path = "/api/student",
    path = "/orders",
    method(get),
    responses(
        (status = 200, description = "The user's orders, newest first", body = Vec<Order>)
    )
)]
pub async fn list_orders(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<Vec<Order>>> {
    Ok(Json(order::list_for_user(&state.database, user.id).await?))
}

#[utoipa::path(
    context_path = "/api/student",
    path = "/orders/{id}",
    method(get),
    params(("id" = i64, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with items and payments", body = OrderDetail),
        (status = 404, description = "No such order for this user")
    )
)]
pub async fn get_order(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<OrderDetail>> {
    Ok(Json(order::get_for_user(&state.database, user.id, id).await?))
}

#[utoipa::path(
    context_path = "/api/student",
    path = "/orders/{id}/cancel",
    method(post),
    params(("id" = i64, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order cancelled", body = OrderDetail),
        (status = 409, description = "Order is no longer pending")
    )
)]
pub async fn cancel_order(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<OrderDetail>> {
    Ok(Json(order::cancel(&state.database, user.id, id).await?))
}

#[utoipa::path(
    context_path = "/api/student",
    path = "/lessons/{id}",
    method(get),
    params(("id" = i64, Path, description = "Lesson id")),
    responses(
        (status = 200, description = "Lesson with signed media links", body = LessonView),
        (status = 403, description = "Not enrolled")
    )
)]
pub async fn get_lesson(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<Json<LessonView>> {
    let lesson = lesson::get_for_viewer(&state.database, id, Viewer::User(user)).await?;
    Ok(Json(state.lesson_view(lesson)))
}

#[utoipa::path(
    context_path = "/api/student",
    path = "/lessons/{id}/progress",
    method(post),
    params(("id" = i64, Path, description = "Lesson id")),
    request_body = ProgressUpdate,
    responses(
        (status = 200, description = "Updated course progress", body = CourseProgress),
        (status = 403, description = "Not enrolled")
    )
)]
pub async fn record_progress(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(update): Json<ProgressUpdate>,
) -> Result<Json<CourseProgress>> {
    let progress = progress::record_lesson_progress(&state.database, user.id, id, update).await?;
    Ok(Json(progress))
}

#[utoipa::path(
    context_path = "/api/student",
    path = "/courses/{id}/progress",
    method(get),
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "Course progress with per-lesson records", body = CourseProgress),
        (status = 404, description = "Not enrolled")
    )
)]
pub async fn course_progress(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(course_id): Path<i64>,
) -> Result<Json<CourseProgress>> {
    Ok(Json(
        progress::course_progress(&state.database, user.id, course_id).await?,
    ))
}

#[utoipa::path(
    context_path = "/api/student",
    path = "/coupons/{code}",
    method(get),
    params(
        ("code" = String, Path, description = "Coupon code"),
        CouponPreviewQuery
    ),
    responses(
        (status = 200, description = "Discount the coupon would give", body = AppliedCoupon),
        (status = 400, description = "Coupon does not apply"),
        (status = 404, description = "Unknown coupon")
    )
)]
pub async fn preview_coupon(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(code): Path<String>,
    Query(query): Query<CouponPreviewQuery>,
) -> Result<Json<AppliedCoupon>> {
    let course = course::get(&state.database, query.course_id).await?;
    if !course.is_published {
        return Err(Error::not_found(format!("Course {}", query.course_id)));
    }
    let applied = coupon::check(&state.database, &code, user.id, course.id, course.price).await?;
    Ok(Json(applied))
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/enrollments", get(list_enrollments))
        .route("/courses/{id}/enroll", post(enroll_free))
        .route("/courses/{id}/checkout", post(checkout))
        .route("/courses/{id}/progress", get(course_progress))
        .route("/orders", get(list_orders))
        .route("/orders/{id}", get(get_order))
        .route("/orders/{id}/cancel", post(cancel_order))
        .route("/lessons/{id}", get(get_lesson))
        .route("/lessons/{id}/progress", post(record_progress))
        .route("/coupons/{code}", get(preview_coupon))
}

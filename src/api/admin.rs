use axum::{
    Json, Router,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tower_sessions::Session;
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::admin::{self as admins, AdminUser, DashboardStats};
use crate::audit::{self, AuditFilter, AuditLog};
use crate::category::{self, Category, CategoryInput};
use crate::coupon::{self, Coupon, CouponInput, CouponUsage};
use crate::course::{self, Course, CourseInput, CourseUpdate};
use crate::enrollment::{self, EnrolledStudent, Enrollment};
use crate::error::{Error, Result};
use crate::lesson;
use crate::order::{self, Order, OrderDetail, OrderStatus};
use crate::storage::AssetKind;
use crate::user::{self, Role, UserInfo};

use super::{
    ADMIN_KEY, AdminSession, CourseWorkspace, SharedState, SuperAdmin, forget, receive_upload,
    remember,
};

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UserFilter {
    pub role: Option<Role>,
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
}

#[derive(Deserialize, ToSchema)]
pub struct RoleChange {
    pub role: Role,
}

#[derive(Deserialize, ToSchema)]
pub struct VerifiedChange {
    pub verified: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct FeaturedChange {
    pub featured: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct ActiveChange {
    pub active: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct CouponCourses {
    /// Empty makes the coupon apply to every course
    pub course_ids: Vec<i64>,
}

#[derive(Deserialize, ToSchema)]
pub struct GrantRequest {
    pub user_id: i64,
    pub course_id: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Deserialize, ToSchema)]
pub struct NewAdminRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub is_super_admin: bool,
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/login",
    method(post),
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AdminUser),
        (status = 401, description = "Invalid credentials"),
        (status = 403, description = "Account disabled")
    )
)]
pub async fn login(
    State(state): State<SharedState>,
    session: Session,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AdminUser>> {
    let mut tx = state.database.begin().await?;
    let admin = admins::admin_login(&mut *tx, &req.email, &req.password).await?;
    audit::record(&mut *tx, admin.id, "login", "admin", Some(admin.id), json!({})).await?;
    let info = admins::get_admin(&mut *tx, admin.id).await?;
    tx.commit().await?;
    remember(&session, ADMIN_KEY, admin).await?;
    Ok(Json(info))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/logout",
    method(post),
    responses(
        (status = 204, description = "Logout successful")
    )
)]
pub async fn logout(session: Session) -> Result<StatusCode> {
    forget(&session).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/me",
    method(get),
    responses(
        (status = 200, description = "Signed-in administrator", body = AdminUser),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn me(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
) -> Result<Json<AdminUser>> {
    Ok(Json(admins::get_admin(&state.database, admin.id).await?))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/stats",
    method(get),
    responses(
        (status = 200, description = "Dashboard counters", body = DashboardStats)
    )
)]
pub async fn stats(
    State(state): State<SharedState>,
    AdminSession(_admin): AdminSession,
) -> Result<Json<DashboardStats>> {
    Ok(Json(admins::dashboard_stats(&state.database).await?))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/categories",
    method(get),
    responses(
        (status = 200, description = "All categories", body = Vec<Category>)
    )
)]
pub async fn list_categories(
    State(state): State<SharedState>,
    AdminSession(_admin): AdminSession,
) -> Result<Json<Vec<Category>>> {
    Ok(Json(category::list(&state.database).await?))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/categories",
    method(post),
    request_body = CategoryInput,
    responses(
        (status = 201, description = "Category created", body = Category),
        (status = 409, description = "Name already used")
    )
)]
pub async fn create_category(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Json(input): Json<CategoryInput>,
) -> Result<(StatusCode, Json<Category>)> {
    let mut tx = state.database.begin().await?;
    let id = category::create(&mut *tx, input).await?;
    let created = category::get(&mut *tx, id).await?;
    audit::record(
        &mut *tx,
        admin.id,
        "create",
        "category",
        Some(id),
        json!({ "name": created.name }),
    )
    .await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/categories/{id}",
    method(put),
    params(("id" = i64, Path, description = "Category id")),
    request_body = CategoryInput,
    responses(
        (status = 200, description = "Category updated", body = Category)
    )
)]
pub async fn update_category(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
    Json(input): Json<CategoryInput>,
) -> Result<Json<Category>> {
    let mut tx = state.database.begin().await?;
    let updated = category::update(&mut *tx, id, input).await?;
    audit::record(
        &mut *tx,
        admin.id,
        "update",
        "category",
        Some(id),
        json!({ "name": updated.name }),
    )
    .await?;
    tx.commit().await?;
    state.invalidate_catalog();
    Ok(Json(updated))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/categories/{id}",
    method(delete),
    params(("id" = i64, Path, description = "Category id")),
    responses(
        (status = 204, description = "Category deleted"),
        (status = 409, description = "Category still has courses")
    )
)]
pub async fn delete_category(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    let mut tx = state.database.begin().await?;
    category::delete(&mut *tx, id).await?;
    audit::record(&mut *tx, admin.id, "delete", "category", Some(id), json!({})).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/courses",
    method(get),
    responses(
        (status = 200, description = "Every course, published or not", body = Vec<Course>)
    )
)]
pub async fn list_courses(
    State(state): State<SharedState>,
    AdminSession(_admin): AdminSession,
) -> Result<Json<Vec<Course>>> {
    let courses = course::list_all(&state.database).await?;
    Ok(Json(
        courses.into_iter().map(|c| state.with_thumbnail(c)).collect(),
    ))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/courses",
    method(post),
    request_body = CourseInput,
    responses(
        (status = 201, description = "Course created as a draft", body = Course),
        (status = 400, description = "Creator is not a professor")
    )
)]
pub async fn create_course(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Json(input): Json<CourseInput>,
) -> Result<(StatusCode, Json<Course>)> {
    let creator_id = input.creator_id;
    let mut tx = state.database.begin().await?;
    let id = course::create(&mut *tx, input).await?;
    let created = course::get(&mut *tx, id).await?;
    audit::record(
        &mut *tx,
        admin.id,
        "create",
        "course",
        Some(id),
        json!({ "title": created.title, "creator_id": creator_id }),
    )
    .await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(state.with_thumbnail(created))))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/courses/{id}",
    method(get),
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "Course with lessons and publishing checklist", body = CourseWorkspace)
    )
)]
pub async fn get_course(
    State(state): State<SharedState>,
    AdminSession(_admin): AdminSession,
    Path(id): Path<i64>,
) -> Result<Json<CourseWorkspace>> {
    let course = course::get(&state.database, id).await?;
    Ok(Json(state.workspace(course).await?))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/courses/{id}",
    method(patch),
    params(("id" = i64, Path, description = "Course id")),
    request_body = CourseUpdate,
    responses(
        (status = 200, description = "Course updated", body = Course)
    )
)]
pub async fn update_course(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
    Json(changes): Json<CourseUpdate>,
) -> Result<Json<Course>> {
    let mut tx = state.database.begin().await?;
    let updated = course::update(&mut *tx, id, changes).await?;
    audit::record(&mut *tx, admin.id, "update", "course", Some(id), json!({})).await?;
    tx.commit().await?;
    state.invalidate_catalog();
    Ok(Json(state.with_thumbnail(updated)))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/courses/{id}",
    method(delete),
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 204, description = "Course, lessons and media removed"),
        (status = 409, description = "Course has enrollments or orders")
    )
)]
pub async fn delete_course(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    let mut tx = state.database.begin().await?;
    let keys = course::delete(&mut *tx, id).await?;
    audit::record(&mut *tx, admin.id, "delete", "course", Some(id), json!({})).await?;
    tx.commit().await?;
    state.invalidate_catalog();
    state.storage.delete_all(&keys).await;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/courses/{id}/publish",
    method(post),
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "Course published", body = Course),
        (status = 400, description = "Checklist items are missing")
    )
)]
pub async fn publish_course(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
) -> Result<Json<Course>> {
    let mut tx = state.database.begin().await?;
    let published = course::publish(&mut *tx, id).await?;
    audit::record(&mut *tx, admin.id, "publish", "course", Some(id), json!({})).await?;
    tx.commit().await?;
    state.invalidate_catalog();
    Ok(Json(state.with_thumbnail(published)))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/courses/{id}/unpublish",
    method(post),
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "Course hidden from the catalog", body = Course)
    )
)]
pub async fn unpublish_course(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
) -> Result<Json<Course>> {
    let mut tx = state.database.begin().await?;
    let hidden = course::unpublish(&mut *tx, id).await?;
    audit::record(&mut *tx, admin.id, "unpublish", "course", Some(id), json!({})).await?;
    tx.commit().await?;
    state.invalidate_catalog();
    Ok(Json(state.with_thumbnail(hidden)))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/courses/{id}/featured",
    method(put),
    params(("id" = i64, Path, description = "Course id")),
    request_body = FeaturedChange,
    responses(
        (status = 200, description = "Featured flag updated", body = Course),
        (status = 400, description = "Course is not published")
    )
)]
pub async fn feature_course(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
    Json(req): Json<FeaturedChange>,
) -> Result<Json<Course>> {
    let mut tx = state.database.begin().await?;
    let updated = course::set_featured(&mut *tx, id, req.featured).await?;
    audit::record(
        &mut *tx,
        admin.id,
        "feature",
        "course",
        Some(id),
        json!({ "featured": req.featured }),
    )
    .await?;
    tx.commit().await?;
    state.invalidate_catalog();
    Ok(Json(state.with_thumbnail(updated)))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/courses/{id}/thumbnail",
    method(post),
    params(("id" = i64, Path, description = "Course id")),
    request_body(content_type = "multipart/form-data", description = "`file`"),
    responses(
        (status = 200, description = "Thumbnail replaced", body = Course),
        (status = 400, description = "Unsupported or oversized image")
    )
)]
pub async fn upload_thumbnail(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
    multipart: Multipart,
) -> Result<Json<Course>> {
    course::get(&state.database, id).await?;
    let upload = receive_upload(multipart, &state.storage, AssetKind::Thumbnail).await?;
    let saved = async {
        let mut tx = state.database.begin().await?;
        let previous = course::set_thumbnail(&mut *tx, id, &upload.key).await?;
        audit::record(&mut *tx, admin.id, "thumbnail", "course", Some(id), json!({})).await?;
        let updated = course::get(&mut *tx, id).await?;
        tx.commit().await?;
        Ok::<_, Error>((previous, updated))
    }
    .await;
    let updated = match saved {
        Ok((previous, updated)) => {
            state.storage.delete_all(&previous.into_iter().collect::<Vec<_>>()).await;
            updated
        }
        Err(e) => {
            state.storage.delete_all(&[upload.key]).await;
            return Err(e);
        }
    };
    state.invalidate_catalog();
    Ok(Json(state.with_thumbnail(updated)))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/lessons/{id}",
    method(delete),
    params(("id" = i64, Path, description = "Lesson id")),
    responses(
        (status = 204, description = "Lesson and its media removed")
    )
)]
pub async fn delete_lesson(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    let mut tx = state.database.begin().await?;
    let keys = lesson::delete(&mut *tx, id).await?;
    audit::record(&mut *tx, admin.id, "delete", "lesson", Some(id), json!({})).await?;
    tx.commit().await?;
    state.invalidate_catalog();
    state.storage.delete_all(&keys).await;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/courses/{id}/students",
    method(get),
    params(("id" = i64, Path, description = "Course id")),
    responses(
        (status = 200, description = "Students of the course with progress", body = Vec<EnrolledStudent>)
    )
)]
pub async fn list_students(
    State(state): State<SharedState>,
    AdminSession(_admin): AdminSession,
    Path(course_id): Path<i64>,
) -> Result<Json<Vec<EnrolledStudent>>> {
    course::get(&state.database, course_id).await?;
    Ok(Json(
        enrollment::students_of_course(&state.database, course_id).await?,
    ))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/users",
    method(get),
    params(UserFilter),
    responses(
        (status = 200, description = "Users, optionally filtered by role", body = Vec<UserInfo>)
    )
)]
pub async fn list_users(
    State(state): State<SharedState>,
    AdminSession(_admin): AdminSession,
    Query(filter): Query<UserFilter>,
) -> Result<Json<Vec<UserInfo>>> {
    Ok(Json(user::list_users(&state.database, filter.role).await?))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/users/{id}/role",
    method(put),
    params(("id" = i64, Path, description = "User id")),
    request_body = RoleChange,
    responses(
        (status = 200, description = "Role changed", body = UserInfo)
    )
)]
pub async fn set_role(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
    Json(req): Json<RoleChange>,
) -> Result<Json<UserInfo>> {
    let mut tx = state.database.begin().await?;
    user::set_role(&mut *tx, id, req.role).await?;
    audit::record(
        &mut *tx,
        admin.id,
        "set_role",
        "user",
        Some(id),
        json!({ "role": req.role }),
    )
    .await?;
    let changed = user::get_user(&mut *tx, id).await?;
    tx.commit().await?;
    Ok(Json(changed))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/users/{id}/verified",
    method(put),
    params(("id" = i64, Path, description = "User id")),
    request_body = VerifiedChange,
    responses(
        (status = 200, description = "Verification changed", body = UserInfo)
    )
)]
pub async fn set_verified(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
    Json(req): Json<VerifiedChange>,
) -> Result<Json<UserInfo>> {
    let mut tx = state.database.begin().await?;
    user::set_verified(&mut *tx, id, req.verified).await?;
    audit::record(
        &mut *tx,
        admin.id,
        "set_verified",
        "user",
        Some(id),
        json!({ "verified": req.verified }),
    )
    .await?;
    let changed = user::get_user(&mut *tx, id).await?;
    tx.commit().await?;
    Ok(Json(changed))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/coupons",
    method(get),
    responses(
        (status = 200, description = "All coupons", body = Vec<Coupon>)
    )
)]
pub async fn list_coupons(
    State(state): State<SharedState>,
    AdminSession(_admin): AdminSession,
) -> Result<Json<Vec<Coupon>>> {
    Ok(Json(coupon::list(&state.database).await?))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/coupons",
    method(post),
    request_body = CouponInput,
    responses(
        (status = 201, description = "Coupon created", body = Coupon),
        (status = 400, description = "Invalid discount, window or caps"),
        (status = 409, description = "Code already exists")
    )
)]
pub async fn create_coupon(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Json(input): Json<CouponInput>,
) -> Result<(StatusCode, Json<Coupon>)> {
    let mut tx = state.database.begin().await?;
    let created = coupon::create(&mut *tx, Some(admin.id), input).await?;
    audit::record(
        &mut *tx,
        admin.id,
        "create",
        "coupon",
        Some(created.id),
        json!({ "code": created.code }),
    )
    .await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/coupons/{id}",
    method(get),
    params(("id" = i64, Path, description = "Coupon id")),
    responses(
        (status = 200, description = "Coupon", body = Coupon)
    )
)]
pub async fn get_coupon(
    State(state): State<SharedState>,
    AdminSession(_admin): AdminSession,
    Path(id): Path<i64>,
) -> Result<Json<Coupon>> {
    Ok(Json(coupon::get(&state.database, id).await?))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/coupons/{id}",
    method(put),
    params(("id" = i64, Path, description = "Coupon id")),
    request_body = CouponInput,
    responses(
        (status = 200, description = "Coupon updated", body = Coupon),
        (status = 409, description = "Discount of a redeemed coupon cannot change")
    )
)]
pub async fn update_coupon(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
    Json(input): Json<CouponInput>,
) -> Result<Json<Coupon>> {
    let mut tx = state.database.begin().await?;
    let updated = coupon::update(&mut *tx, id, input).await?;
    audit::record(&mut *tx, admin.id, "update", "coupon", Some(id), json!({})).await?;
    tx.commit().await?;
    Ok(Json(updated))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/coupons/{id}",
    method(delete),
    params(("id" = i64, Path, description = "Coupon id")),
    responses(
        (status = 204, description = "Coupon deleted"),
        (status = 409, description = "Coupon has been used")
    )
)]
pub async fn delete_coupon(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    let mut tx = state.database.begin().await?;
    coupon::delete(&mut *tx, id).await?;
    audit::record(&mut *tx, admin.id, "delete", "coupon", Some(id), json!({})).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/coupons/{id}/active",
    method(put),
    params(("id" = i64, Path, description = "Coupon id")),
    request_body = ActiveChange,
    responses(
        (status = 200, description = "Coupon (de)activated", body = Coupon)
    )
)]
pub async fn set_coupon_active(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
    Json(req): Json<ActiveChange>,
) -> Result<Json<Coupon>> {
    let mut tx = state.database.begin().await?;
    coupon::set_active(&mut *tx, id, req.active).await?;
    audit::record(
        &mut *tx,
        admin.id,
        "set_active",
        "coupon",
        Some(id),
        json!({ "active": req.active }),
    )
    .await?;
    let changed = coupon::get(&mut *tx, id).await?;
    tx.commit().await?;
    Ok(Json(changed))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/coupons/{id}/courses",
    method(put),
    params(("id" = i64, Path, description = "Coupon id")),
    request_body = CouponCourses,
    responses(
        (status = 200, description = "Course scope replaced", body = Coupon)
    )
)]
pub async fn set_coupon_courses(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
    Json(req): Json<CouponCourses>,
) -> Result<Json<Coupon>> {
    let mut tx = state.database.begin().await?;
    let updated = coupon::set_courses(&mut *tx, id, &req.course_ids).await?;
    audit::record(
        &mut *tx,
        admin.id,
        "set_courses",
        "coupon",
        Some(id),
        json!({ "course_ids": req.course_ids }),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(updated))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/coupons/{id}/usages",
    method(get),
    params(("id" = i64, Path, description = "Coupon id")),
    responses(
        (status = 200, description = "Redemptions of the coupon", body = Vec<CouponUsage>)
    )
)]
pub async fn coupon_usages(
    State(state): State<SharedState>,
    AdminSession(_admin): AdminSession,
    Path(id): Path<i64>,
) -> Result<Json<Vec<CouponUsage>>> {
    Ok(Json(coupon::usage_report(&state.database, id).await?))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/orders",
    method(get),
    params(OrderFilter),
    responses(
        (status = 200, description = "Orders, newest first", body = Vec<Order>)
    )
)]
pub async fn list_orders(
    State(state): State<SharedState>,
    AdminSession(_admin): AdminSession,
    Query(filter): Query<OrderFilter>,
) -> Result<Json<Vec<Order>>> {
    Ok(Json(order::list_all(&state.database, filter.status).await?))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/orders/{id}",
    method(get),
    params(("id" = i64, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with items and payments", body = OrderDetail)
    )
)]
pub async fn get_order(
    State(state): State<SharedState>,
    AdminSession(_admin): AdminSession,
    Path(id): Path<i64>,
) -> Result<Json<OrderDetail>> {
    Ok(Json(order::get_order(&state.database, id).await?))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/enrollments",
    method(post),
    request_body = GrantRequest,
    responses(
        (status = 201, description = "Access granted without payment", body = Enrollment),
        (status = 409, description = "User already enrolled")
    )
)]
pub async fn grant_enrollment(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Json(req): Json<GrantRequest>,
) -> Result<(StatusCode, Json<Enrollment>)> {
    let mut tx = state.database.begin().await?;
    let granted = enrollment::grant(&mut *tx, req.user_id, req.course_id, req.expires_at).await?;
    audit::record(
        &mut *tx,
        admin.id,
        "grant",
        "enrollment",
        Some(granted.id),
        json!({ "user_id": req.user_id, "course_id": req.course_id }),
    )
    .await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(granted)))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/enrollments/{id}/refund",
    method(post),
    params(("id" = i64, Path, description = "Enrollment id")),
    responses(
        (status = 200, description = "Enrollment refunded", body = Enrollment),
        (status = 409, description = "Already refunded")
    )
)]
pub async fn refund_enrollment(
    State(state): State<SharedState>,
    AdminSession(admin): AdminSession,
    Path(id): Path<i64>,
) -> Result<Json<Enrollment>> {
    let mut tx = state.database.begin().await?;
    let refunded = enrollment::refund(&mut *tx, id).await?;
    audit::record(
        &mut *tx,
        admin.id,
        "refund",
        "enrollment",
        Some(id),
        json!({ "order_id": refunded.order_id, "price_paid": refunded.price_paid }),
    )
    .await?;
    tx.commit().await?;
    Ok(Json(refunded))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/audit-logs",
    method(get),
    params(AuditFilter),
    responses(
        (status = 200, description = "Administrative actions, newest first", body = Vec<AuditLog>)
    )
)]
pub async fn list_audit_logs(
    State(state): State<SharedState>,
    AdminSession(_admin): AdminSession,
    Query(filter): Query<AuditFilter>,
) -> Result<Json<Vec<AuditLog>>> {
    Ok(Json(audit::list(&state.database, &filter).await?))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/admins",
    method(get),
    responses(
        (status = 200, description = "All administrators", body = Vec<AdminUser>),
        (status = 403, description = "Super admin required")
    )
)]
pub async fn list_admins(
    State(state): State<SharedState>,
    SuperAdmin(_admin): SuperAdmin,
) -> Result<Json<Vec<AdminUser>>> {
    Ok(Json(admins::list_admins(&state.database).await?))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/admins",
    method(post),
    request_body = NewAdminRequest,
    responses(
        (status = 201, description = "Administrator created", body = AdminUser),
        (status = 403, description = "Super admin required"),
        (status = 409, description = "Email already used")
    )
)]
pub async fn create_admin(
    State(state): State<SharedState>,
    SuperAdmin(acting): SuperAdmin,
    Json(req): Json<NewAdminRequest>,
) -> Result<(StatusCode, Json<AdminUser>)> {
    let mut tx = state.database.begin().await?;
    let id = admins::create_admin(
        &mut *tx,
        &req.name,
        &req.email,
        &req.password,
        req.is_super_admin,
    )
    .await?;
    audit::record(
        &mut *tx,
        acting.id,
        "create",
        "admin",
        Some(id),
        json!({ "email": req.email, "is_super_admin": req.is_super_admin }),
    )
    .await?;
    let created = admins::get_admin(&mut *tx, id).await?;
    tx.commit().await?;
    info!("admin {} created admin {}", acting.id, id);
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    context_path = "/api/admin",
    path = "/admins/{id}/active",
    method(put),
    params(("id" = i64, Path, description = "Admin id")),
    request_body = ActiveChange,
    responses(
        (status = 200, description = "Administrator (de)activated", body = AdminUser),
        (status = 400, description = "Cannot disable yourself"),
        (status = 403, description = "Super admin required")
    )
)]
pub async fn set_admin_active(
    State(state): State<SharedState>,
    SuperAdmin(acting): SuperAdmin,
    Path(id): Path<i64>,
    Json(req): Json<ActiveChange>,
) -> Result<Json<AdminUser>> {
    let mut tx = state.database.begin().await?;
    admins::set_admin_active(&mut *tx, acting, id, req.active).await?;
    audit::record(
        &mut *tx,
        acting.id,
        "set_active",
        "admin",
        Some(id),
        json!({ "active": req.active }),
    )
    .await?;
    let changed = admins::get_admin(&mut *tx, id).await?;
    tx.commit().await?;
    Ok(Json(changed))
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/stats", get(stats))
        .route("/categories", get(list_categories).post(create_category))
        .route("/categories/{id}", put(update_category).delete(delete_category))
        .route("/courses", get(list_courses).post(create_course))
        .route(
            "/courses/{id}",
            get(get_course).patch(update_course).delete(delete_course),
        )
        .route("/courses/{id}/publish", post(publish_course))
        .route("/courses/{id}/unpublish", post(unpublish_course))
        .route("/courses/{id}/featured", put(feature_course))
        .route("/courses/{id}/thumbnail", post(upload_thumbnail))
        .route("/courses/{id}/students", get(list_students))
        .route("/lessons/{id}", delete(delete_lesson))
        .route("/users", get(list_users))
        .route("/users/{id}/role", put(set_role))
        .route("/users/{id}/verified", put(set_verified))
        .route("/coupons", get(list_coupons).post(create_coupon))
        .route(
            "/coupons/{id}",
            get(get_coupon).put(update_coupon).delete(delete_coupon),
        )
        .route("/coupons/{id}/active", put(set_coupon_active))
        .route("/coupons/{id}/courses", put(set_coupon_courses))
        .route("/coupons/{id}/usages", get(coupon_usages))
        .route("/orders", get(list_orders))
        .route("/orders/{id}", get(get_order))
        .route("/enrollments", post(grant_enrollment))
        .route("/enrollments/{id}/refund", post(refund_enrollment))
        .route("/audit-logs", get(list_audit_logs))
        .route("/admins", get(list_admins).post(create_admin))
        .route("/admins/{id}/active", put(set_admin_active))
}

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use tracing::info;
use utoipa::ToSchema;

use crate::error::Result;
use crate::user::{self, Role, UserInfo};

use super::{CurrentUser, SharedState, USER_KEY, forget, remember};

#[derive(Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, ToSchema)]
pub struct LoginResponse {
    pub id: i64,
    pub role: Role,
    pub is_verified: bool,
}

#[derive(Deserialize, ToSchema)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub bio: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct PasswordChange {
    pub old_password: String,
    pub new_password: String,
}

#[utoipa::path(
    context_path = "/api/auth",
    path = "/register",
    method(post),
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "Student account created", body = UserInfo),
        (status = 400, description = "Invalid email or password"),
        (status = 409, description = "Email already registered")
    )
)]
pub async fn register(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserInfo>)> {
    let RegisterRequest {
        name,
        email,
        password,
    } = req;
    let id = user::register(&state.database, name, email, password).await?;
    let info = user::get_user(&state.database, id).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

#[utoipa::path(
    context_path = "/api/auth",
    path = "/login",
    method(post),
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn login(
    State(state): State<SharedState>,
    session: Session,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let user = user::login(&state.database, &req.email, &req.password).await?;
    remember(&session, USER_KEY, user).await?;
    info!("user {} signed in", user.id);
    Ok(Json(LoginResponse {
        id: user.id,
        role: user.role,
        is_verified: user.is_verified,
    }))
}

#[utoipa::path(
    context_path = "/api/auth",
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
    context_path = "/api/auth",
    path = "/me",
    method(get),
    responses(
        (status = 200, description = "Signed-in user", body = UserInfo),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn me(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<Json<UserInfo>> {
    Ok(Json(user::get_user(&state.database, user.id).await?))
}

#[utoipa::path(
    context_path = "/api/auth",
    path = "/me",
    method(put),
    request_body = ProfileUpdate,
    responses(
        (status = 200, description = "Profile updated", body = UserInfo),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn update_profile(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<ProfileUpdate>,
) -> Result<Json<UserInfo>> {
    let info = user::update_profile(&state.database, user.id, req.name, req.bio).await?;
    Ok(Json(info))
}

#[utoipa::path(
    context_path = "/api/auth",
    path = "/password",
    method(post),
    request_body = PasswordChange,
    responses(
        (status = 204, description = "Password changed"),
        (status = 400, description = "New password too short"),
        (status = 401, description = "Current password is wrong")
    )
)]
pub async fn change_password(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<PasswordChange>,
) -> Result<StatusCode> {
    user::change_password(&state.database, user.id, &req.old_password, &req.new_password).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(me).put(update_profile))
        .route("/password", post(change_password))
}

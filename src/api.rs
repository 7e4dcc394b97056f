pub mod admin;
pub mod auth;
pub mod media;
pub mod payments;
pub mod professor;
pub mod public;
pub mod student;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart},
    http::request::Parts,
};
use moka::future::Cache;
use serde::Serialize;
use sqlx::SqlitePool;
use tower_http::limit::RequestBodyLimitLayer;
use tower_sessions::Session;
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::admin::{SessionAdmin, session_admin};
use crate::config::Config;
use crate::course::{self, Course, CourseDetail, ReadinessIssue};
use crate::error::{Error, Result};
use crate::lesson::{self, Lesson, Viewer};
use crate::signing::Signer;
use crate::storage::{AssetKind, Storage};
use crate::user::{self, Role, SessionUser};

pub const USER_KEY: &str = "user";
pub const ADMIN_KEY: &str = "admin";
/// Provider name recorded on payments settled through the webhook.
pub const PAYMENT_PROVIDER: &str = "gateway";

pub struct AppState {
    pub database: SqlitePool,
    pub storage: Storage,
    pub config: Config,
    pub webhook: Signer,
    /// Published course pages by slug
    pub catalog: Cache<String, CourseDetail>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub async fn new(database: SqlitePool, config: Config) -> anyhow::Result<Self> {
        let storage = Storage::new(
            &config.media_root,
            &config.secrets.media_signing,
            config.max_upload_bytes(),
        )
        .await?;
        Ok(Self {
            database,
            storage,
            webhook: Signer::webhook(&config.secrets.payment_webhook),
            catalog: Cache::builder()
                .max_capacity(1000)
                .time_to_live(std::time::Duration::from_secs(600))
                .build(),
            config,
        })
    }

    pub fn signed_url(&self, key: &str) -> String {
        self.storage.signed_url(key, self.config.signed_url_ttl_secs)
    }

    pub fn with_thumbnail(&self, mut course: Course) -> Course {
        course.thumbnail_url = course.thumbnail_key.as_deref().map(|k| self.signed_url(k));
        course
    }

    pub fn lesson_view(&self, lesson: Lesson) -> LessonView {
        LessonView {
            video_url: lesson.video_key.as_deref().map(|k| self.signed_url(k)),
            document_url: lesson.document_key.as_deref().map(|k| self.signed_url(k)),
            lesson,
        }
    }

    /// Drop cached course pages after any course or lesson change.
    pub fn invalidate_catalog(&self) {
        self.catalog.invalidate_all();
    }

    pub async fn workspace(&self, course: Course) -> Result<CourseWorkspace> {
        let lessons = lesson::list_for_course(&self.database, course.id).await?;
        let readiness = course::publish_readiness(&course, &lessons);
        Ok(CourseWorkspace {
            course: self.with_thumbnail(course),
            lessons: lessons.into_iter().map(|l| self.lesson_view(l)).collect(),
            readiness,
        })
    }
}

/// A lesson together with short-lived links to its media.
#[derive(Debug, Serialize, ToSchema)]
pub struct LessonView {
    #[serde(flatten)]
    pub lesson: Lesson,
    pub video_url: Option<String>,
    pub document_url: Option<String>,
}

/// Authoring view of a course: every lesson with media, and what still blocks publishing.
#[derive(Debug, Serialize, ToSchema)]
pub struct CourseWorkspace {
    #[serde(flatten)]
    pub course: Course,
    pub lessons: Vec<LessonView>,
    pub readiness: Vec<ReadinessIssue>,
}

async fn session<S: Send + Sync>(parts: &mut Parts, state: &S) -> Result<Session> {
    Session::from_request_parts(parts, state)
        .await
        .map_err(|(_, msg)| Error::Internal(anyhow::anyhow!(msg)))
}

async fn session_value<T: serde::de::DeserializeOwned>(session: &Session, key: &str) -> Result<Option<T>> {
    session
        .get::<T>(key)
        .await
        .map_err(|e| Error::Internal(e.into()))
}

/// Store a freshly authenticated identity under a new session id.
pub async fn remember<T: Serialize>(session: &Session, key: &str, value: T) -> Result<()> {
    session
        .cycle_id()
        .await
        .map_err(|e| Error::Internal(e.into()))?;
    session
        .insert(key, value)
        .await
        .map_err(|e| Error::Internal(e.into()))
}

pub async fn forget(session: &Session) -> Result<()> {
    session.flush().await.map_err(|e| Error::Internal(e.into()))
}

/// Any signed-in user.
pub struct CurrentUser(pub SessionUser);

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let session = session(parts, state).await?;
        session_value::<SessionUser>(&session, USER_KEY)
            .await?
            .map(CurrentUser)
            .ok_or_else(|| Error::Unauthorized("Sign in required".to_string()))
    }
}

/// A verified professor. Role and verification are read fresh from the database.
pub struct Professor(pub SessionUser);

impl FromRequestParts<SharedState> for Professor {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        let info = user::get_user(&state.database, user.id).await.map_err(|e| match e {
            Error::NotFound(_) => Error::Unauthorized("Account no longer exists".to_string()),
            other => other,
        })?;
        if info.role != Role::Professor {
            return Err(Error::Forbidden("Professor access required".to_string()));
        }
        if !info.is_verified {
            return Err(Error::Forbidden("Professor account is not verified".to_string()));
        }
        Ok(Professor(SessionUser {
            id: info.id,
            role: info.role,
            is_verified: info.is_verified,
        }))
    }
}

/// An active administrator. Activity and the super-admin flag come from the database.
pub struct AdminSession(pub SessionAdmin);

impl FromRequestParts<SharedState> for AdminSession {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self> {
        let session = session(parts, state).await?;
        let stored = session_value::<SessionAdmin>(&session, ADMIN_KEY)
            .await?
            .ok_or_else(|| Error::Unauthorized("Admin sign in required".to_string()))?;
        Ok(AdminSession(
            session_admin(&state.database, stored.id).await?,
        ))
    }
}

pub struct SuperAdmin(pub SessionAdmin);

impl FromRequestParts<SharedState> for SuperAdmin {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self> {
        let AdminSession(admin) = AdminSession::from_request_parts(parts, state).await?;
        if !admin.is_super_admin {
            return Err(Error::Forbidden("Super admin access required".to_string()));
        }
        Ok(SuperAdmin(admin))
    }
}

/// Resolve who is looking at a lesson from whatever the session holds.
/// A disabled or removed admin only keeps the user identity, if any.
pub async fn viewer(database: &SqlitePool, session: &Session) -> Result<Viewer> {
    if let Some(stored) = session_value::<SessionAdmin>(session, ADMIN_KEY).await? {
        match session_admin(database, stored.id).await {
            Ok(_) => return Ok(Viewer::Admin),
            Err(Error::Unauthorized(_) | Error::Forbidden(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(match session_value::<SessionUser>(session, USER_KEY).await? {
        Some(user) => Viewer::User(user),
        None => Viewer::Anonymous,
    })
}

/// A stored upload plus the plain text fields sent alongside it.
pub struct Upload {
    pub key: String,
    pub fields: HashMap<String, String>,
}

/// Read a multipart body holding exactly one file into storage.
pub async fn receive_upload(mut multipart: Multipart, storage: &Storage, kind: AssetKind) -> Result<Upload> {
    let mut key = None;
    let mut fields = HashMap::new();
    let bad_chunk = |e: axum::extract::multipart::MultipartError| {
        Error::BadRequest(format!("Failed to read chunk: {}", e))
    };
    while let Some(field) = multipart.next_field().await.map_err(bad_chunk)? {
        let name = field.name().unwrap_or_default().to_string();
        let Some(filename) = field.file_name().map(str::to_string) else {
            let value = field.text().await.map_err(bad_chunk)?;
            fields.insert(name, value);
            continue;
        };
        if key.is_some() {
            continue;
        }
        let content_type = field.content_type().map(str::to_string);
        key = Some(
            storage
                .put_stream(kind, &filename, content_type.as_deref(), field)
                .await?,
        );
    }
    let key = key.ok_or_else(|| Error::BadRequest("No file found".to_string()))?;
    Ok(Upload { key, fields })
}

#[derive(OpenApi)]
#[openapi(
    paths(
        public::list_categories,
        public::list_courses,
        public::get_course,
        public::get_lesson,
        auth::register,
        auth::login,
        auth::logout,
        auth::me,
        auth::update_profile,
        auth::change_password,
        student::list_enrollments,
        student::enroll_free,
        student::checkout,
        student::list_orders,
        student::get_order,
        student::cancel_order,
        student::get_lesson,
        student::record_progress,
        student::course_progress,
        student::preview_coupon,
        professor::list_courses,
        professor::get_course,
        professor::update_course,
        professor::create_lesson,
        professor::update_lesson,
        professor::delete_lesson,
        professor::reorder_lessons,
        professor::upload_video,
        professor::upload_document,
        professor::list_students,
        admin::login,
        admin::logout,
        admin::me,
        admin::stats,
        admin::list_categories,
        admin::create_category,
        admin::update_category,
        admin::delete_category,
        admin::list_courses,
        admin::create_course,
        admin::get_course,
        admin::update_course,
        admin::delete_course,
        admin::publish_course,
        admin::unpublish_course,
        admin::feature_course,
        admin::upload_thumbnail,
        admin::delete_lesson,
        admin::list_students,
        admin::list_users,
        admin::set_role,
        admin::set_verified,
        admin::list_coupons,
        admin::create_coupon,
        admin::get_coupon,
        admin::update_coupon,
        admin::delete_coupon,
        admin::set_coupon_active,
        admin::set_coupon_courses,
        admin::coupon_usages,
        admin::list_orders,
        admin::get_order,
        admin::grant_enrollment,
        admin::refund_enrollment,
        admin::list_audit_logs,
        admin::list_admins,
        admin::create_admin,
        admin::set_admin_active,
        payments::webhook,
        media::serve,
    ),
    components(schemas(crate::error::ErrorBody)),
    info(title = "Course server", description = "Course catalog, enrollment and learning API")
)]
pub struct ApiDoc;

pub fn openapi_json() -> anyhow::Result<String> {
    Ok(ApiDoc::openapi().to_pretty_json()?)
}

/// Every route of the service. Sessions are layered on by the caller.
pub fn router(state: SharedState) -> Router {
    let max_upload = state.config.max_upload_bytes();
    let api = Router::new()
        .nest("/public", public::routes())
        .nest("/auth", auth::routes())
        .nest("/student", student::routes())
        .nest("/professor", professor::routes())
        .nest("/admin", admin::routes())
        .nest("/payments", payments::routes());
    Router::new()
        .nest("/api", api)
        .merge(media::routes())
        .with_state(state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload))
}

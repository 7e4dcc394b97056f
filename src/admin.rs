use serde::{Deserialize, Serialize};
use sqlx::{Acquire, Sqlite, SqliteExecutor, SqlitePool};
use time::OffsetDateTime;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::error::{Error, Result};
use crate::user::{hash_password, validate_credentials, verify_password};
use crate::utils::now_utc;

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct AdminUser {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub is_super_admin: bool,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// What a logged-in administrator carries in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAdmin {
    pub id: i64,
    pub is_super_admin: bool,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct DashboardStats {
    pub students: i64,
    pub professors: i64,
    pub courses: i64,
    pub published_courses: i64,
    pub active_enrollments: i64,
    pub paid_orders: i64,
    /// Sum of paid order totals, in cents
    pub revenue: i64,
    pub coupon_redemptions: i64,
}

pub async fn create_admin(
    executor: impl SqliteExecutor<'_>,
    name: &str,
    email: &str,
    password: &str,
    is_super_admin: bool,
) -> Result<i64> {
    let email = email.trim().to_lowercase();
    validate_credentials(&email, password)?;
    let id = sqlx::query(
        "INSERT INTO admin_users (name, email, password, is_super_admin, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(name.trim())
    .bind(&email)
    .bind(hash_password(password)?)
    .bind(is_super_admin)
    .bind(now_utc())
    .execute(executor)
    .await?
    .last_insert_rowid();
    info!("created admin {} <{}> super={}", id, email, is_super_admin);
    Ok(id)
}

pub fn admin_login<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    email: &'a str,
    password: &'a str,
) -> impl Future<Output = Result<SessionAdmin>> + Send + 'a {
    async move {
    #[derive(sqlx::FromRow)]
    struct Row {
        id: i64,
        password: String,
        is_super_admin: bool,
        is_active: bool,
    }
    let email = email.trim().to_lowercase();
    let mut conn = database.acquire().await?;
    let row: Option<Row> = sqlx::query_as(
        "SELECT id, password, is_super_admin, is_active FROM admin_users WHERE email = ?",
    )
    .bind(&email)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row.filter(|row| verify_password(password, &row.password)) else {
        warn!("failed admin login for {}", email);
        return Err(Error::Unauthorized("Invalid email or password".to_string()));
    };
    if !row.is_active {
        return Err(Error::Forbidden("Admin account is disabled".to_string()));
    }
    sqlx::query("UPDATE admin_users SET last_login_at = ? WHERE id = ?")
        .bind(now_utc())
        .bind(row.id)
        .execute(&mut *conn)
        .await?;
    Ok(SessionAdmin {
        id: row.id,
        is_super_admin: row.is_super_admin,
    })
    }
}

/// Re-read an admin's standing for a request: a removed account is signed out,
/// a disabled one is refused.
pub async fn session_admin(executor: impl SqliteExecutor<'_>, id: i64) -> Result<SessionAdmin> {
    let admin = get_admin(executor, id).await.map_err(|e| match e {
        Error::NotFound(_) => Error::Unauthorized("Admin account no longer exists".to_string()),
        other => other,
    })?;
    if !admin.is_active {
        return Err(Error::Forbidden("Admin account is disabled".to_string()));
    }
    Ok(SessionAdmin {
        id: admin.id,
        is_super_admin: admin.is_super_admin,
    })
}

pub async fn get_admin(executor: impl SqliteExecutor<'_>, id: i64) -> Result<AdminUser> {
    sqlx::query_as(
        "SELECT id, name, email, is_super_admin, is_active, last_login_at, created_at
         FROM admin_users WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| Error::not_found(format!("Admin {id}")))
}

pub async fn list_admins(database: &SqlitePool) -> Result<Vec<AdminUser>> {
    let admins = sqlx::query_as(
        "SELECT id, name, email, is_super_admin, is_active, last_login_at, created_at
         FROM admin_users ORDER BY id",
    )
    .fetch_all(database)
    .await?;
    Ok(admins)
}

pub async fn set_admin_active(
    executor: impl SqliteExecutor<'_>,
    acting: SessionAdmin,
    id: i64,
    active: bool,
) -> Result<()> {
    if !acting.is_super_admin {
        return Err(Error::Forbidden("Super admin required".to_string()));
    }
    if acting.id == id && !active {
        return Err(Error::BadRequest("Cannot disable your own account".to_string()));
    }
    let result = sqlx::query("UPDATE admin_users SET is_active = ? WHERE id = ?")
        .bind(active)
        .bind(id)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("Admin {id}")));
    }
    Ok(())
}

pub async fn dashboard_stats(database: &SqlitePool) -> Result<DashboardStats> {
    let stats = sqlx::query_as::<_, (i64, i64, i64, i64, i64, i64, i64, i64)>(
        "SELECT
            (SELECT COUNT(*) FROM users WHERE role = 'student'),
            (SELECT COUNT(*) FROM users WHERE role = 'professor'),
            (SELECT COUNT(*) FROM courses),
            (SELECT COUNT(*) FROM courses WHERE is_published = 1),
            (SELECT COUNT(*) FROM enrollments WHERE status = 'active'),
            (SELECT COUNT(*) FROM orders WHERE status = 'paid'),
            (SELECT COALESCE(SUM(total), 0) FROM orders WHERE status = 'paid'),
            (SELECT COUNT(*) FROM coupon_usages)",
    )
    .fetch_one(database)
    .await?;
    Ok(DashboardStats {
        students: stats.0,
        professors: stats.1,
        courses: stats.2,
        published_courses: stats.3,
        active_enrollments: stats.4,
        paid_orders: stats.5,
        revenue: stats.6,
        coupon_redemptions: stats.7,
    })
}

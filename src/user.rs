use argon2::{
    Argon2, PasswordVerifier,
    password_hash::{PasswordHash, PasswordHasher, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteExecutor, SqlitePool};
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;

use crate::error::{Error, Result};
use crate::utils::{is_valid_email, now_utc};

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Professor,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow, ToSchema)]
pub struct UserInfo {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub is_verified: bool,
    pub bio: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// What a logged-in user carries in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub id: i64,
    pub role: Role,
    pub is_verified: bool,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    pub is_verified: bool,
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {}", e))?
        .to_string();
    Ok(hash)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

pub(crate) fn validate_credentials(email: &str, password: &str) -> Result<()> {
    if !is_valid_email(email) {
        return Err(Error::BadRequest(format!("Invalid email: {email}")));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

pub async fn create_user(database: &SqlitePool, user: NewUser) -> Result<i64> {
    let name = user.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::BadRequest("Name is required".to_string()));
    }
    let email = user.email.trim().to_lowercase();
    validate_credentials(&email, &user.password)?;
    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(database)
        .await?;
    if exists.is_some() {
        return Err(Error::Conflict(format!("Email {email} is already registered")));
    }
    let password_hash = hash_password(&user.password)?;
    let now = now_utc();
    let id = sqlx::query(
        "INSERT INTO users (name, email, password, role, is_verified, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&name)
    .bind(&email)
    .bind(password_hash)
    .bind(user.role)
    .bind(user.is_verified)
    .bind(now)
    .bind(now)
    .execute(database)
    .await?
    .last_insert_rowid();
    info!("created {:?} account {} <{}>", user.role, id, email);
    Ok(id)
}

/// Self-service sign up, always a student account.
pub async fn register(
    database: &SqlitePool,
    name: String,
    email: String,
    password: String,
) -> Result<i64> {
    create_user(
        database,
        NewUser {
            name,
            email,
            password,
            role: Role::Student,
            is_verified: false,
        },
    )
    .await
}

pub async fn login(database: &SqlitePool, email: &str, password: &str) -> Result<SessionUser> {
    #[derive(sqlx::FromRow)]
    struct Row {
        id: i64,
        password: String,
        role: Role,
        is_verified: bool,
    }
    let email = email.trim().to_lowercase();
    let row: Option<Row> =
        sqlx::query_as("SELECT id, password, role, is_verified FROM users WHERE email = ?")
            .bind(&email)
            .fetch_optional(database)
            .await?;
    match row {
        Some(row) if verify_password(password, &row.password) => Ok(SessionUser {
            id: row.id,
            role: row.role,
            is_verified: row.is_verified,
        }),
        _ => Err(Error::Unauthorized("Invalid email or password".to_string())),
    }
}

const USER_COLUMNS: &str = "id, name, email, role, is_verified, bio, created_at";

pub async fn get_user(executor: impl SqliteExecutor<'_>, id: i64) -> Result<UserInfo> {
    sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| Error::not_found(format!("User {id}")))
}

pub async fn list_users(database: &SqlitePool, role: Option<Role>) -> Result<Vec<UserInfo>> {
    let users = match role {
        Some(role) => {
            sqlx::query_as(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE role = ? ORDER BY id"
            ))
            .bind(role)
            .fetch_all(database)
            .await?
        }
        None => {
            sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))
                .fetch_all(database)
                .await?
        }
    };
    Ok(users)
}

pub async fn set_role(executor: impl SqliteExecutor<'_>, id: i64, role: Role) -> Result<()> {
    let result = sqlx::query("UPDATE users SET role = ?, updated_at = ? WHERE id = ?")
        .bind(role)
        .bind(now_utc())
        .bind(id)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("User {id}")));
    }
    Ok(())
}

pub async fn set_verified(executor: impl SqliteExecutor<'_>, id: i64, verified: bool) -> Result<()> {
    let result = sqlx::query("UPDATE users SET is_verified = ?, updated_at = ? WHERE id = ?")
        .bind(verified)
        .bind(now_utc())
        .bind(id)
        .execute(executor)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("User {id}")));
    }
    Ok(())
}

pub async fn update_profile(
    database: &SqlitePool,
    id: i64,
    name: Option<String>,
    bio: Option<String>,
) -> Result<UserInfo> {
    if let Some(name) = &name {
        if name.trim().is_empty() {
            return Err(Error::BadRequest("Name is required".to_string()));
        }
    }
    sqlx::query(
        "UPDATE users SET name = COALESCE(?, name), bio = COALESCE(?, bio), updated_at = ?
         WHERE id = ?",
    )
    .bind(name.map(|n| n.trim().to_string()))
    .bind(bio)
    .bind(now_utc())
    .bind(id)
    .execute(database)
    .await?;
    get_user(database, id).await
}

pub async fn change_password(
    database: &SqlitePool,
    id: i64,
    old_password: &str,
    new_password: &str,
) -> Result<()> {
    let hash: String = sqlx::query_scalar("SELECT password FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(database)
        .await?
        .ok_or_else(|| Error::not_found(format!("User {id}")))?;
    if !verify_password(old_password, &hash) {
        return Err(Error::Unauthorized("Current password is incorrect".to_string()));
    }
    if new_password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    sqlx::query("UPDATE users SET password = ?, updated_at = ? WHERE id = ?")
        .bind(hash_password(new_password)?)
        .bind(now_utc())
        .bind(id)
        .execute(database)
        .await?;
    Ok(())
}

pub async fn delete_user(database: &SqlitePool, id: i64) -> Result<()> {
    let result = sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(id)
        .execute(database)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("User {id}")));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;

    pub(crate) async fn professor(database: &SqlitePool, email: &str) -> i64 {
        create_user(
            database,
            NewUser {
                name: "Prof".to_string(),
                email: email.to_string(),
                password: "professor-pass".to_string(),
                role: Role::Professor,
                is_verified: true,
            },
        )
        .await
        .unwrap()
    }

    pub(crate) async fn student(database: &SqlitePool, email: &str) -> i64 {
        register(
            database,
            "Student".to_string(),
            email.to_string(),
            "student-pass".to_string(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn register_then_login() {
        let database = db::memory().await.unwrap();
        let id = register(
            &database,
            "Ada".to_string(),
            "Ada@Example.com".to_string(),
            "correct horse".to_string(),
        )
        .await
        .unwrap();
        let session = login(&database, "ada@example.com", "correct horse")
            .await
            .unwrap();
        assert_eq!(session.id, id);
        assert_eq!(session.role, Role::Student);
        assert!(!session.is_verified);

        let err = login(&database, "ada@example.com", "wrong horse")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        let err = login(&database, "nobody@example.com", "correct horse")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let database = db::memory().await.unwrap();
        student(&database, "dup@example.com").await;
        let err = register(
            &database,
            "Other".to_string(),
            "DUP@example.com".to_string(),
            "another-pass".to_string(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn rejects_short_password_and_bad_email() {
        let database = db::memory().await.unwrap();
        let err = register(&database, "A".into(), "a@b.co".into(), "short".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        let err = register(&database, "A".into(), "not-an-email".into(), "long-enough".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn role_and_verification_changes() {
        let database = db::memory().await.unwrap();
        let id = student(&database, "s@example.com").await;
        set_role(&database, id, Role::Professor).await.unwrap();
        set_verified(&database, id, true).await.unwrap();
        let user = get_user(&database, id).await.unwrap();
        assert_eq!(user.role, Role::Professor);
        assert!(user.is_verified);
        assert_eq!(list_users(&database, Some(Role::Student)).await.unwrap().len(), 0);
        assert!(matches!(
            set_role(&database, 999, Role::Student).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn change_password_requires_old_one() {
        let database = db::memory().await.unwrap();
        let id = student(&database, "p@example.com").await;
        assert!(matches!(
            change_password(&database, id, "nope-nope", "brand-new-pass")
                .await
                .unwrap_err(),
            Error::Unauthorized(_)
        ));
        change_password(&database, id, "student-pass", "brand-new-pass")
            .await
            .unwrap();
        login(&database, "p@example.com", "brand-new-pass")
            .await
            .unwrap();
    }
}

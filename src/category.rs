use serde::{Deserialize, Serialize};
use sqlx::{Acquire, Sqlite, SqliteExecutor, SqlitePool};
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::db;
use crate::error::{Error, Result};
use crate::utils::now_utc;

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub course_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CategoryInput {
    pub name: String,
    pub description: Option<String>,
}

const CATEGORY_SELECT: &str = "SELECT c.id, c.name, c.slug, c.description, c.created_at,
        (SELECT COUNT(*) FROM courses WHERE category_id = c.id) AS course_count
    FROM categories c";

fn validated(input: &CategoryInput) -> Result<String> {
    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(Error::BadRequest("Category name is required".to_string()));
    }
    Ok(name)
}

fn name_taken(name: &str) -> impl FnOnce(sqlx::Error) -> Error + '_ {
    move |e| match Error::from(e) {
        Error::Conflict(_) => Error::Conflict(format!("Category {name} already exists")),
        other => other,
    }
}

pub fn create<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    input: CategoryInput,
) -> impl Future<Output = Result<i64>> + Send + 'a {
    async move {
    let name = validated(&input)?;
    let mut conn = database.acquire().await?;
    let slug = db::unique_slug(&mut *conn, "categories", "category", &name).await?;
    let id = sqlx::query(
        "INSERT INTO categories (name, slug, description, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&name)
    .bind(&slug)
    .bind(input.description)
    .bind(now_utc())
    .execute(&mut *conn)
    .await
    .map_err(name_taken(&name))?
    .last_insert_rowid();
    Ok(id)
    }
}

/// Renaming keeps the slug so existing links stay valid.
pub fn update<'a>(
    database: impl Acquire<'a, Database = Sqlite> + Send + 'a,
    id: i64,
    input: CategoryInput,
) -> impl Future<Output = Result<Category>> + Send + 'a {
    async move {
    let name = validated(&input)?;
    let mut conn = database.acquire().await?;
    let result = sqlx::query("UPDATE categories SET name = ?, description = ? WHERE id = ?")
        .bind(&name)
        .bind(input.description)
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(name_taken(&name))?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("Category {id}")));
    }
    get(&mut *conn, id).await
    }
}

pub async fn get(executor: impl SqliteExecutor<'_>, id: i64) -> Result<Category> {
    sqlx::query_as(&format!("{CATEGORY_SELECT} WHERE c.id = ?"))
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| Error::not_found(format!("Category {id}")))
}

pub async fn list(database: &SqlitePool) -> Result<Vec<Category>> {
    let categories = sqlx::query_as(&format!("{CATEGORY_SELECT} ORDER BY c.name"))
        .fetch_all(database)
        .await?;
    Ok(categories)
}

/// Categories still referenced by a course cannot be removed.
pub fn delete<'a>(database: impl Acquire<'a, Database = Sqlite> + Send + 'a, id: i64) -> impl Future<Output = Result<()>> + Send + 'a {
    async move {
    let mut conn = database.acquire().await?;
    let category = get(&mut *conn, id).await?;
    if category.course_count > 0 {
        return Err(Error::Conflict(format!(
            "Category {} still has {} course(s)",
            category.name, category.course_count
        )));
    }
    sqlx::query("DELETE FROM categories WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
    }
}

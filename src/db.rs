use std::str::FromStr;

use sqlx::{
    SqliteConnection, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::info;

use crate::error::Result;
use crate::utils::{random_code, slugify};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open (or create) the database, enforce foreign keys and run pending migrations.
pub async fn connect(url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    let database = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&database).await?;
    info!("database ready at {}", url);
    Ok(database)
}

/// Private in-memory database. One connection that never expires, so the data lives
/// as long as the pool.
pub async fn memory() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let database = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&database).await?;
    Ok(database)
}

/// First free slug for `text` in `table`: the bare slug, then `-2`, `-3`, ...
/// Text with nothing sluggable (e.g. non-Latin titles) gets `{fallback}-{random}`.
pub async fn unique_slug(
    conn: &mut SqliteConnection,
    table: &'static str,
    fallback: &str,
    text: &str,
) -> Result<String> {
    let mut base = slugify(text);
    if base.is_empty() {
        base = format!("{fallback}-{}", random_code(8).to_lowercase());
    }
    let query = format!("SELECT id FROM {table} WHERE slug = ?");
    let mut slug = base.clone();
    let mut n = 2;
    loop {
        let taken: Option<i64> = sqlx::query_scalar(&query)
            .bind(&slug)
            .fetch_optional(&mut *conn)
            .await?;
        if taken.is_none() {
            return Ok(slug);
        }
        slug = format!("{base}-{n}");
        n += 1;
    }
}

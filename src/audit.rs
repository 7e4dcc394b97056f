//! Append-only log of administrative actions.

use serde::{Deserialize, Serialize};
use sqlx::{SqliteExecutor, SqlitePool};
use time::OffsetDateTime;
use utoipa::{IntoParams, ToSchema};

use crate::error::Result;
use crate::utils::now_utc;

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct AuditLog {
    pub id: i64,
    pub admin_id: Option<i64>,
    pub admin_email: Option<String>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<i64>,
    #[schema(value_type = Object)]
    #[sqlx(json)]
    pub details: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AuditFilter {
    pub admin_id: Option<i64>,
    pub entity_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Append an entry. Pass the transaction of the audited change so both commit together.
pub async fn record(
    executor: impl SqliteExecutor<'_>,
    admin_id: i64,
    action: &str,
    entity_type: &str,
    entity_id: Option<i64>,
    details: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO audit_logs (admin_id, action, entity_type, entity_id, details, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(admin_id)
    .bind(action)
    .bind(entity_type)
    .bind(entity_id)
    .bind(details.to_string())
    .bind(now_utc())
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn list(database: &SqlitePool, filter: &AuditFilter) -> Result<Vec<AuditLog>> {
    let logs = sqlx::query_as(
        "SELECT l.id, l.admin_id, a.email AS admin_email, l.action, l.entity_type, l.entity_id,
                l.details, l.created_at
         FROM audit_logs l LEFT JOIN admin_users a ON a.id = l.admin_id
         WHERE (?1 IS NULL OR l.admin_id = ?1) AND (?2 IS NULL OR l.entity_type = ?2)
         ORDER BY l.id DESC LIMIT ?3 OFFSET ?4",
    )
    .bind(filter.admin_id)
    .bind(filter.entity_type.as_deref())
    .bind(filter.limit.unwrap_or(50).clamp(1, 500))
    .bind(filter.offset.unwrap_or(0).max(0))
    .fetch_all(database)
    .await?;
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{admin, db};
    use serde_json::json;

    #[tokio::test]
    async fn newest_first_and_filtered() {
        let database = db::memory().await.unwrap();
        let admin_id = admin::create_admin(&database, "Root", "root@example.com", "root-password", true)
            .await
            .unwrap();
        record(&database, admin_id, "category.create", "category", Some(1), json!({"name": "Rust"}))
            .await
            .unwrap();
        record(&database, admin_id, "course.publish", "course", Some(7), json!({}))
            .await
            .unwrap();

        let all = list(&database, &AuditFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].action, "course.publish");
        assert_eq!(all[1].details["name"], "Rust");
        assert_eq!(all[0].admin_email.as_deref(), Some("root@example.com"));

        let courses = list(
            &database,
            &AuditFilter {
                entity_type: Some("course".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(courses.len(), 1);
        assert_eq!(courses[0].entity_id, Some(7));
    }

    #[tokio::test]
    async fn rolled_back_with_its_transaction() {
        let database = db::memory().await.unwrap();
        let admin_id = admin::create_admin(&database, "Root", "root@example.com", "root-password", true)
            .await
            .unwrap();
        let mut tx = database.begin().await.unwrap();
        record(&mut *tx, admin_id, "delete", "course", Some(3), json!({}))
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert!(list(&database, &AuditFilter::default()).await.unwrap().is_empty());
    }
}
